//! Cache protocol bandwidth statistics (client-side).
//!
//! Tracks what the cache protocols actually cost on the wire against an
//! estimate of what the same rectangles would have cost without them, so
//! end-of-run logs can report the achieved reduction.

use rfb_common::Rect;

/// Aggregate bandwidth statistics for a single cache protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheProtocolStats {
    /// Bytes actually received for reference messages
    /// (CachedRect / PersistentCachedRect).
    pub cached_rect_bytes: u64,
    pub cached_rect_count: u32,

    /// Bytes actually received for init messages
    /// (CachedRectInit / PersistentCachedRectInit).
    pub cached_rect_init_bytes: u64,
    pub cached_rect_init_count: u32,

    /// Estimated bytes that would have been received without the cache.
    pub alternative_bytes: u64,
}

impl CacheProtocolStats {
    /// Estimated bytes saved compared to the alternative baseline.
    pub fn bandwidth_saved(&self) -> u64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        self.alternative_bytes.saturating_sub(used)
    }

    /// Estimated reduction percentage vs the alternative baseline.
    pub fn reduction_percentage(&self) -> f64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        if self.alternative_bytes == 0 || used >= self.alternative_bytes {
            0.0
        } else {
            100.0 * (self.alternative_bytes - used) as f64 / self.alternative_bytes as f64
        }
    }

    /// Human-readable one-line summary for the shutdown statistics log.
    pub fn format_summary(&self, label: &str) -> String {
        format!(
            "{}: {} bandwidth saving ({:.1}% reduction, {} refs, {} inits)",
            label,
            human_bytes(self.bandwidth_saved()),
            self.reduction_percentage(),
            self.cached_rect_count,
            self.cached_rect_init_count,
        )
    }
}

/// Protocol-level operation counters maintained by the decode orchestrator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheProtocolCounters {
    pub cache_lookups: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub queries_sent: u32,
    pub reports_sent: u32,
    pub evictions_sent: u32,
    pub seeds_stored: u32,
}

/// Combined per-session statistics: one bandwidth bucket per protocol
/// plus the operation counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCacheStats {
    pub content: CacheProtocolStats,
    pub persistent: CacheProtocolStats,
    pub counters: CacheProtocolCounters,
}

/// Conservative estimate of compressed size given uncompressed bytes
/// (assume ~10:1, matching the classic viewer's helper).
fn estimate_compressed(uncompressed: u64) -> u64 {
    uncompressed / 10
}

/// Track a reference (CachedRect / PersistentCachedRect) operation.
///
/// `ref_body_bytes` is the body size after the 12-byte rect header (8 for
/// content ids, 16 for full keys).
pub fn track_cache_ref(
    stats: &mut CacheProtocolStats,
    rect: &Rect,
    bpp_bytes: u64,
    ref_body_bytes: u64,
) {
    let uncompressed = rect.area() * bpp_bytes;
    stats.cached_rect_bytes = stats.cached_rect_bytes.saturating_add(12 + ref_body_bytes);
    stats.alternative_bytes = stats
        .alternative_bytes
        .saturating_add(16 + estimate_compressed(uncompressed));
    stats.cached_rect_count = stats.cached_rect_count.saturating_add(1);
}

/// Track an init (CachedRectInit / PersistentCachedRectInit) operation.
///
/// `payload_bytes` is the inner encoding's payload size; `id_bytes` is 8
/// for content ids, 16 for full keys.
pub fn track_cache_init(stats: &mut CacheProtocolStats, id_bytes: u64, payload_bytes: u64) {
    // Overhead: 12 header + id + 4 inner encoding.
    stats.cached_rect_init_bytes = stats
        .cached_rect_init_bytes
        .saturating_add(12 + id_bytes + 4 + payload_bytes);
    // Baseline: 12 header + 4 encoding + payload.
    stats.alternative_bytes = stats
        .alternative_bytes
        .saturating_add(16 + payload_bytes);
    stats.cached_rect_init_count = stats.cached_rect_init_count.saturating_add(1);
}

/// Simple IEC-style byte formatter (bytes, KiB, MiB, GiB).
fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GIB {
        format!("{:.3} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.3} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.3} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}
