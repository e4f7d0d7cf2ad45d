//! Error types for the viewer-side cache session.

use std::io;
use thiserror::Error;

/// Errors that can occur while driving a cache session.
#[derive(Debug, Error)]
pub enum RfbClientError {
    /// Transport-level error (stream reads and writes).
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Protocol error (malformed message, invalid cache envelope). The
    /// connection must be closed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Encoding/decoding error from a registered codec.
    #[error("Encoding error: {0}")]
    Encoding(#[from] anyhow::Error),

    /// Cache engine error.
    #[error("Cache error: {0}")]
    Cache(#[from] rfb_cache::CacheError),

    /// An encoding appeared for which no decoder is registered.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(i32),

    /// The session has been shut down.
    #[error("Connection closed")]
    ConnectionClosed,
}
