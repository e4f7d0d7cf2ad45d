//! Cached entry representation.

use crate::quality::QualityCode;
use bytes::Bytes;
use rfb_common::CacheKey;
use std::time::Instant;

/// Location of a flushed payload inside the shard files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLocator {
    /// Monotonically increasing 16-bit shard file id.
    pub shard_id: u16,
    /// Byte offset of the record header within the shard file.
    pub offset: u64,
    /// Payload length in bytes (record header excluded).
    pub length: u32,
}

/// A decoded rectangle held by the viewer cache.
///
/// Pixels are tightly packed in the canonical 32bpp format (stride = width).
/// The source bpp/depth describe the wire format the pixels originally
/// arrived in; they feed the quality code, not the storage layout.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// Hash the server computed from the lossless framebuffer pixels.
    pub canonical: CacheKey,
    /// Hash of the pixels the viewer actually decoded (primary key).
    pub actual: CacheKey,
    /// Rectangle width in pixels.
    pub width: u32,
    /// Rectangle height in pixels.
    pub height: u32,
    /// Bits per pixel of the source wire format.
    pub source_bpp: u16,
    /// Colour depth of the source wire format.
    pub source_depth: u16,
    /// Tightly packed canonical pixels (stride = width).
    pub pixels: Bytes,
    /// 3-bit quality code (lossy flag + depth class).
    pub quality: QualityCode,
    /// Whether this entry may be flushed to disk.
    pub persistable: bool,
    /// Collision verifier: bytes 16..20 of the full content hash.
    pub verifier: u32,
    /// Last access timestamp for recency tie-breaks.
    pub last_used: Instant,
    /// Set once the payload has been appended to a shard.
    pub locator: Option<ShardLocator>,
}

impl CachedEntry {
    /// Approximate resident size in bytes, used for the ARC byte budget.
    pub fn byte_size(&self) -> usize {
        self.pixels.len() + std::mem::size_of::<Self>()
    }

    /// Exact payload size (what a shard record stores).
    pub fn payload_len(&self) -> usize {
        self.pixels.len()
    }

    /// True when canonical and actual identity agree.
    pub fn is_lossless(&self) -> bool {
        self.canonical == self.actual
    }

    /// Update the access timestamp.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Does this entry serve a lookup for the given geometry and minimum
    /// source depth?
    pub fn matches(&self, width: u32, height: u32, min_bpp: u8) -> bool {
        self.width == width && self.height == height && self.quality.meets_min_bpp(min_bpp)
    }
}
