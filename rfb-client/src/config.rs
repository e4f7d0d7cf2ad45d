//! Configuration for the viewer-side cache session.

use rfb_cache::CacheEngineConfig;
use serde::{Deserialize, Serialize};

/// Viewer session configuration.
///
/// Loadable from TOML; every field has a sensible default so a partial
/// file (or none at all) works.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ViewerConfig {
    /// Cache engine settings (sizes, disk, path).
    #[serde(default)]
    pub cache: CacheEngineConfig,

    /// Decode pipeline settings.
    #[serde(default)]
    pub decode: DecodeConfig,
}

/// Decode orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Worker count; 0 means min(4, available parallelism).
    #[serde(default)]
    pub workers: usize,

    /// Bound of the decode work queue (items, not bytes).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Cold entries hydrated from disk per flush boundary.
    #[serde(default = "default_hydrate_batch")]
    pub hydrate_batch: usize,

    /// Flush boundaries between periodic dirty-index saves.
    #[serde(default = "default_index_save_interval")]
    pub index_save_interval: u32,
}

fn default_queue_depth() -> usize {
    16
}

fn default_hydrate_batch() -> usize {
    rfb_cache::store::HYDRATE_BATCH
}

fn default_index_save_interval() -> u32 {
    64
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: default_queue_depth(),
            hydrate_batch: default_hydrate_batch(),
            index_save_interval: default_index_save_interval(),
        }
    }
}

impl DecodeConfig {
    /// Resolve the effective worker count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get().min(4).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ViewerConfig::default();
        assert!(config.cache.content_cache);
        assert!(config.cache.persistent_cache);
        assert_eq!(config.decode.queue_depth, 16);
        assert_eq!(config.decode.hydrate_batch, 32);
        assert!(config.decode.effective_workers() >= 1);
        assert!(config.decode.effective_workers() <= 4);
    }

    #[test]
    fn test_partial_toml() {
        let config: ViewerConfig = toml::from_str(
            r#"
            [cache]
            persistent_cache = false

            [decode]
            workers = 2
            "#,
        )
        .unwrap();
        assert!(!config.cache.persistent_cache);
        assert_eq!(config.decode.effective_workers(), 2);
        assert_eq!(config.decode.index_save_interval, 64);
    }
}
