//! Viewer-side cache orchestration.
//!
//! This crate drives the cache protocols on the client: it frames
//! framebuffer-update rectangles, intercepts the cache envelopes (init,
//! reference, seed), feeds a bounded decode worker pool, and batches the
//! back-channel traffic (evictions, queries, lossy hash reports) at flush
//! boundaries.
//!
//! # Quick Start
//!
//! ```no_run
//! use rfb_client::{CacheSession, ViewerConfig};
//! use rfb_encodings::PixelFormat;
//! use rfb_protocol::{RfbInStream, RfbOutStream};
//!
//! # async fn example<R, W>(reader: R, writer: W) -> anyhow::Result<()>
//! # where R: tokio::io::AsyncRead + Unpin, W: tokio::io::AsyncWrite + Unpin {
//! let mut session = CacheSession::new(
//!     ViewerConfig::default(),
//!     1920,
//!     1080,
//!     PixelFormat::canonical(),
//! );
//!
//! let mut input = RfbInStream::new(reader);
//! let mut output = RfbOutStream::new(writer);
//!
//! // Advertise cache support and previously persisted content.
//! let _encodings = session.advertised_pseudo_encodings();
//! session.send_startup_hash_list(&mut output).await?;
//!
//! // Per FramebufferUpdate (message type already consumed):
//! let damage = session.apply_update(&mut input, &mut output).await?;
//! # drop(damage);
//!
//! // On disconnect:
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Transport, handshake, and display belong to the embedding application;
//! this crate only needs the established streams.

pub mod config;
mod decode;
pub mod errors;
pub mod framebuffer;
pub mod session;
pub mod stats;

pub use config::{DecodeConfig, ViewerConfig};
pub use errors::RfbClientError;
pub use framebuffer::Framebuffer;
pub use session::{CacheProtocolNegotiated, CacheSession};
pub use stats::{CacheProtocolCounters, CacheProtocolStats, ClientCacheStats};
