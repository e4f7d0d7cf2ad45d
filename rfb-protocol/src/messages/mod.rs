//! Cache protocol message types.
//!
//! This module provides types and parsers for the cache protocol extensions
//! exchanged between client and server:
//!
//! - **Core types** ([`types`]) - Rectangle header, update framing, and
//!   encoding / message-type constants
//! - **Cache messages** ([`cache`]) - rectangle envelopes (init, reference,
//!   seed) and client-to-server back-channel messages (evictions, queries,
//!   hash list, hash report)
//!
//! # Wire Format Rules
//!
//! 1. **Big-endian byte order** - All multi-byte integers use network byte order
//! 2. **Count validation** - List counts are bounded; oversized counts are
//!    protocol errors and the connection is closed
//! 3. **Fail-fast errors** - Invalid data results in errors, no defensive
//!    fallbacks
//!
//! Rectangle envelopes only parse their fixed headers; the inner encoding's
//! payload is consumed by the decoder registered for that encoding.

pub mod cache;
pub mod types;

#[cfg(test)]
mod proptest_framing;

// Re-export commonly used types
pub use cache::{
    CacheEviction, CachedRect, CachedRectInit, CachedRectSeed, ClientCacheMessage,
    PersistentCacheEviction, PersistentCacheHashReport, PersistentCacheQuery,
    PersistentCachedRect, PersistentCachedRectInit, PersistentHashList, RequestCachedData,
};
pub use types::{FramebufferUpdateHeader, Rectangle};
