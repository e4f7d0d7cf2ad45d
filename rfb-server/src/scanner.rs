//! Shift-tolerant scanner.
//!
//! Optional pre-pass over a damage region that re-hashes candidate tiles at
//! several sizes and grid phases, asking a predicate whether the client
//! already holds each one. Content that merely moved on screen (a scrolled
//! document, a dragged window) re-aligns with a previously cached tile at
//! some phase, turning fresh damage into plain references.
//!
//! The scan is budgeted: it stops early on wall-clock time, on a hashed
//! block count, or once the hits cover enough of the damage. Emitted hits
//! never overlap each other.

use crate::config::{PhaseMode, ScannerConfig};
use rfb_cache::hash::hash_rect;
use rfb_common::{CacheKey, Rect, Region};
use rfb_pixelbuffer::PixelBuffer;
use std::time::Instant;

/// One tile the client already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    pub rect: Rect,
    pub key: CacheKey,
}

/// Scan effort and outcome counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Candidate tiles enumerated.
    pub blocks_considered: u64,
    /// Tiles actually hashed (after cheap rejections).
    pub blocks_hashed: u64,
    /// Hits emitted to the encoder.
    pub hits_emitted: u64,
    /// Rectangles in the effective (padded) damage region.
    pub packed_rects: usize,
    /// Wall-clock time spent, in microseconds.
    pub elapsed_us: u64,
}

/// Result of one scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub hits: Vec<ScanHit>,
    pub stats: ScanStats,
}

/// The scanner; holds only configuration.
pub struct ShiftScanner {
    config: ScannerConfig,
}

impl ShiftScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan `damage` for tiles `client_knows` already holds.
    pub fn scan(
        &self,
        pb: &dyn PixelBuffer,
        damage: &Region,
        client_knows: &dyn Fn(&CacheKey) -> bool,
    ) -> ScanResult {
        let mut result = ScanResult::default();
        if !self.config.enabled || damage.is_empty() {
            return result;
        }

        let start = Instant::now();
        let bounds = pb.get_rect();
        let damage_area = damage.area().max(1);
        result.stats.packed_rects = damage.rects().len();

        let mut tile_sizes = self.config.tile_sizes.clone();
        if self.config.prefer_largest_first {
            tile_sizes.sort_unstable_by(|a, b| b.cmp(a));
        }

        let mut covered = Region::new();
        let mut done = false;

        'sizes: for tile in tile_sizes {
            if tile == 0 {
                continue;
            }
            for (phase_x, phase_y) in phases(tile, self.config.phases) {
                for candidate in
                    tile_grid(damage, &bounds, self.config.pad_pixels, tile, phase_x, phase_y)
                {
                    result.stats.blocks_considered += 1;
                    if covered.intersects(&candidate) {
                        continue;
                    }
                    if result.stats.blocks_hashed >= self.config.max_blocks as u64 {
                        done = true;
                        break 'sizes;
                    }
                    if start.elapsed().as_micros() as u64 > self.config.budget_us {
                        done = true;
                        break 'sizes;
                    }

                    let Ok(digest) = hash_rect(pb, candidate) else {
                        continue;
                    };
                    result.stats.blocks_hashed += 1;

                    if client_knows(&digest.key) {
                        covered.add(candidate);
                        result.hits.push(ScanHit {
                            rect: candidate,
                            key: digest.key,
                        });
                        result.stats.hits_emitted += 1;

                        let permille = covered.area() * 1000 / damage_area;
                        if permille >= self.config.coverage_threshold_permille as u64 {
                            done = true;
                            break 'sizes;
                        }
                    }
                }
            }
        }

        result.stats.elapsed_us = start.elapsed().as_micros() as u64;
        if done || !result.hits.is_empty() {
            tracing::debug!(
                hits = result.stats.hits_emitted,
                hashed = result.stats.blocks_hashed,
                elapsed_us = result.stats.elapsed_us,
                "shift scan finished"
            );
        }
        result
    }
}

/// The phase offsets to try for a tile size.
fn phases(tile: u32, mode: PhaseMode) -> Vec<(u32, u32)> {
    match mode {
        PhaseMode::Minimal => vec![(0, 0)],
        PhaseMode::Quarter => {
            let steps = [0, tile / 4, tile / 2];
            let mut out = Vec::with_capacity(9);
            for &py in &steps {
                for &px in &steps {
                    out.push((px, py));
                }
            }
            out.dedup();
            out
        }
    }
}

/// Enumerate full tiles intersecting the (padded) damage, on a grid
/// anchored at each damage rect's top-left corner plus the phase offset.
///
/// Anchoring at the damage origin is what makes moved content findable:
/// when a window scrolls or drags, the damage tracks the moved pixels, so
/// the zero-phase tile of the new damage lines up with the cached tile of
/// the old position. The phase sweep covers residual sub-tile offsets, and
/// the padding widens the searched extent without moving the anchor.
/// Tiles must lie fully within the framebuffer.
fn tile_grid(
    damage: &Region,
    bounds: &Rect,
    pad: u32,
    tile: u32,
    phase_x: u32,
    phase_y: u32,
) -> Vec<Rect> {
    let mut out = Vec::new();
    let t = tile as i64;
    for rect in damage.rects() {
        let padded = rect.padded_within(pad, bounds);
        let anchor_x = rect.x as i64 + phase_x as i64;
        let anchor_y = rect.y as i64 + phase_y as i64;
        let first_col = (padded.x as i64 - anchor_x).div_euclid(t);
        let last_col = (padded.right() as i64 - 1 - anchor_x).div_euclid(t);
        let first_row = (padded.y as i64 - anchor_y).div_euclid(t);
        let last_row = (padded.bottom() as i64 - 1 - anchor_y).div_euclid(t);
        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let candidate = Rect::new(
                    (anchor_x + col * t) as i32,
                    (anchor_y + row * t) as i32,
                    tile,
                    tile,
                );
                let inside = candidate.x >= bounds.x
                    && candidate.y >= bounds.y
                    && candidate.right() <= bounds.right()
                    && candidate.bottom() <= bounds.bottom();
                if inside && !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
    }
    out
}
