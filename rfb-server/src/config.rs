//! Server-side cache configuration.

use serde::{Deserialize, Serialize};

/// Per-server cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCacheConfig {
    /// Emit cache messages to clients that advertised ContentCache.
    #[serde(default = "default_true")]
    pub enable_content_cache: bool,

    /// Emit cache messages to clients that advertised PersistentCache.
    #[serde(default = "default_true")]
    pub enable_persistent_cache: bool,

    /// Rectangle area (pixels) below which caching is skipped entirely.
    #[serde(default = "default_min_rect_area")]
    pub min_rect_area: u32,

    /// Age-based TTL in seconds for server-side payloads (0 = unlimited).
    #[serde(default)]
    pub max_age_secs: u64,

    /// Byte budget of the server-side payload store, in MB.
    #[serde(default = "default_store_size_mb")]
    pub store_size_mb: usize,

    /// How lossy rectangles teach the client their cache entry.
    #[serde(default)]
    pub seed_policy: SeedPolicy,

    /// Shift-tolerant scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// Policy for lossy encodings: both paths are legal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Send the rectangle normally encoded, followed by a seed message.
    /// The documented protocol design; seeds are never skipped based on
    /// encoding lossiness.
    #[default]
    AlwaysSeed,
    /// Wrap the lossy payload in a cache init envelope instead.
    InitWrap,
}

/// Phase sets the scanner tries per tile size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// Aligned tiles only: `{(0, 0)}`.
    #[default]
    Minimal,
    /// Nine phases: `{0, T/4, T/2}` in each axis.
    Quarter,
}

/// Shift-tolerant scanner tunables. The budgets are heuristics; treat them
/// as starting points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Run the scanner pre-pass at all.
    #[serde(default)]
    pub enabled: bool,

    /// Tile edge lengths to try, in pixels.
    #[serde(default = "default_tile_sizes")]
    pub tile_sizes: Vec<u32>,

    /// Phase set per tile size.
    #[serde(default)]
    pub phases: PhaseMode,

    /// Wall-clock budget per scan, in microseconds.
    #[serde(default = "default_budget_us")]
    pub budget_us: u64,

    /// Maximum number of tiles hashed per scan.
    #[serde(default = "default_max_blocks")]
    pub max_blocks: u32,

    /// Stop once hits cover this share of the damage, in permille.
    #[serde(default = "default_coverage_permille")]
    pub coverage_threshold_permille: u32,

    /// Try larger tile sizes before smaller ones.
    #[serde(default = "default_true")]
    pub prefer_largest_first: bool,

    /// Expand the damage by this many pixels before enumerating tiles so
    /// slightly moved windows still land on cached blocks.
    #[serde(default = "default_pad_pixels")]
    pub pad_pixels: u32,
}

fn default_true() -> bool {
    true
}

fn default_min_rect_area() -> u32 {
    4096 // 64x64 pixels minimum
}

fn default_store_size_mb() -> usize {
    512
}

fn default_tile_sizes() -> Vec<u32> {
    vec![256, 128, 64]
}

fn default_budget_us() -> u64 {
    2000
}

fn default_max_blocks() -> u32 {
    5000
}

fn default_coverage_permille() -> u32 {
    700
}

fn default_pad_pixels() -> u32 {
    8
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tile_sizes: default_tile_sizes(),
            phases: PhaseMode::Minimal,
            budget_us: default_budget_us(),
            max_blocks: default_max_blocks(),
            coverage_threshold_permille: default_coverage_permille(),
            prefer_largest_first: true,
            pad_pixels: default_pad_pixels(),
        }
    }
}

impl Default for ServerCacheConfig {
    fn default() -> Self {
        Self {
            enable_content_cache: true,
            enable_persistent_cache: true,
            min_rect_area: default_min_rect_area(),
            max_age_secs: 0,
            store_size_mb: default_store_size_mb(),
            seed_policy: SeedPolicy::default(),
            scanner: ScannerConfig::default(),
        }
    }
}
