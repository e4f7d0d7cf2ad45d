//! Error types for the cache engine.
//!
//! Disk failures are never fatal to a session: write errors mark the entry
//! non-persistable, read errors degrade to cache misses. The only errors
//! that escalate are protocol-level (handled in the wire layer, not here).

use thiserror::Error;

/// Errors that can occur inside the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying file or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The rectangle cannot enter the cache (zero area, unreadable pixels,
    /// unrepresentable pixel depth).
    #[error("uncacheable rectangle: {0}")]
    Uncacheable(String),

    /// On-disk state failed validation (bad magic, length, or hash).
    #[error("corrupt {what}: {detail}")]
    Corrupt {
        what: &'static str,
        detail: String,
    },

    /// On-disk state was written by an incompatible version.
    #[error("unsupported {what} version {found} (expected {expected})")]
    VersionMismatch {
        what: &'static str,
        found: u16,
        expected: u16,
    },

    /// An insert's pixel data does not match the declared dimensions.
    #[error("dimension mismatch: {given} bytes for {width}x{height} rect")]
    DimensionMismatch {
        given: usize,
        width: u32,
        height: u32,
    },

    /// Disk persistence is not configured for this cache.
    #[error("disk persistence is disabled")]
    DiskDisabled,
}

/// Result alias used throughout the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
