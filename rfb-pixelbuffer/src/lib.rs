//! Pixel formats and buffers for the RFB cache subsystem.
//!
//! This crate provides pixel format descriptions, the buffer access traits,
//! and a concrete owned buffer. It also pins down the **canonical pixel
//! domain** used for content hashing and on-disk cache storage: 32 bits per
//! pixel, 24-bit depth, little-endian, true colour, shifts R16/G8/B0
//! ([`PixelFormat::canonical`]). Viewer-local formats are converted into
//! this domain before hashing and before pixels enter or leave storage.
//!
//! # Critical: Stride is in Pixels, Not Bytes!
//!
//! All stride values in this API are measured in **pixels**, not bytes.
//! To calculate byte offsets:
//!
//! ```text
//! byte_offset = (y * stride + x) * bytes_per_pixel
//! byte_length = height * stride * bytes_per_pixel
//! ```

pub mod buffer;
pub mod format;
pub mod managed;

pub use buffer::{MutablePixelBuffer, PixelBuffer};
pub use format::PixelFormat;
pub use managed::ManagedPixelBuffer;
