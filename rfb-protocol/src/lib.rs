//! Wire protocol layer for the cache subsystem.
//!
//! This crate provides the buffered I/O streams and the serialisation of the
//! cache protocol extensions:
//!
//! - [`io`] - [`RfbInStream`](io::RfbInStream) / [`RfbOutStream`](io::RfbOutStream)
//!   big-endian buffered streams over any `AsyncRead`/`AsyncWrite`
//! - [`messages`] - rectangle envelopes (reference, init, seed) and the
//!   client-to-server back-channel (evictions, queries, hash list, hash
//!   report)
//!
//! The outer protocol handshake and transport live with the embedding
//! application; everything here operates on already-established streams.

pub mod io;
pub mod messages;

// Re-export commonly used types
pub use io::{RfbInStream, RfbOutStream};
pub use messages::{FramebufferUpdateHeader, Rectangle};
