//! Cache engine configuration.
//!
//! An explicit [`CacheEngineConfig`] value is handed to each component; the
//! engine has no process-wide parameter lookups. Fields map one-to-one to
//! the viewer-side configuration surface and default to the documented
//! values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Viewer-side cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEngineConfig {
    /// Enable the session-only ContentCache protocol.
    #[serde(default = "default_true")]
    pub content_cache: bool,

    /// Enable the cross-session PersistentCache protocol (and advertise
    /// its pseudo-encoding).
    #[serde(default = "default_true")]
    pub persistent_cache: bool,

    /// Memory cap in MB when only the ContentCache is enabled.
    #[serde(default = "default_cache_size_mb")]
    pub content_cache_size_mb: usize,

    /// Memory cap in MB for the unified cache.
    #[serde(default = "default_cache_size_mb")]
    pub persistent_cache_size_mb: usize,

    /// Disk cap in MB. 0 means twice the memory cap; -1 disables disk.
    #[serde(default)]
    pub disk_size_mb: i64,

    /// Maximum bytes per shard file, in MB.
    #[serde(default = "default_shard_size_mb")]
    pub shard_size_mb: usize,

    /// Cache directory for `index.dat` and the shards.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_cache_size_mb() -> usize {
    2048 // 2GB default
}

fn default_shard_size_mb() -> usize {
    64
}

fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tigervnc")
        .join("persistentcache")
}

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            content_cache: true,
            persistent_cache: true,
            content_cache_size_mb: default_cache_size_mb(),
            persistent_cache_size_mb: default_cache_size_mb(),
            disk_size_mb: 0,
            shard_size_mb: default_shard_size_mb(),
            cache_path: default_cache_path(),
        }
    }
}

impl CacheEngineConfig {
    /// The effective in-memory byte budget: the persistent cap when the
    /// PersistentCache is on, the content cap otherwise.
    pub fn memory_limit_bytes(&self) -> usize {
        let mb = if self.persistent_cache {
            self.persistent_cache_size_mb
        } else {
            self.content_cache_size_mb
        };
        mb.saturating_mul(1024 * 1024)
    }

    /// Disk budget in bytes, or `None` when disk persistence is disabled
    /// (`disk_size_mb == -1`, or the PersistentCache itself is off).
    pub fn disk_limit_bytes(&self) -> Option<u64> {
        if !self.persistent_cache || self.disk_size_mb < 0 {
            return None;
        }
        if self.disk_size_mb == 0 {
            Some(2 * self.memory_limit_bytes() as u64)
        } else {
            Some(self.disk_size_mb as u64 * 1024 * 1024)
        }
    }

    /// True when entries may be flushed to shards at all.
    pub fn disk_enabled(&self) -> bool {
        self.disk_limit_bytes().is_some()
    }

    /// Per-shard byte limit.
    pub fn shard_limit_bytes(&self) -> u64 {
        (self.shard_size_mb as u64).saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheEngineConfig::default();
        assert!(config.content_cache);
        assert!(config.persistent_cache);
        assert_eq!(config.content_cache_size_mb, 2048);
        assert_eq!(config.persistent_cache_size_mb, 2048);
        assert_eq!(config.disk_size_mb, 0);
        assert_eq!(config.shard_size_mb, 64);
        assert!(config
            .cache_path
            .to_string_lossy()
            .contains("persistentcache"));
    }

    #[test]
    fn test_disk_default_is_twice_memory() {
        let config = CacheEngineConfig {
            persistent_cache_size_mb: 100,
            ..Default::default()
        };
        assert_eq!(config.disk_limit_bytes(), Some(2 * 100 * 1024 * 1024));
    }

    #[test]
    fn test_disk_disabled() {
        let config = CacheEngineConfig {
            disk_size_mb: -1,
            ..Default::default()
        };
        assert!(!config.disk_enabled());
        assert_eq!(config.disk_limit_bytes(), None);
    }

    #[test]
    fn test_memory_cap_follows_protocol() {
        let config = CacheEngineConfig {
            persistent_cache: false,
            content_cache_size_mb: 10,
            persistent_cache_size_mb: 20,
            ..Default::default()
        };
        assert_eq!(config.memory_limit_bytes(), 10 * 1024 * 1024);
        // ContentCache-only sessions never touch disk.
        assert!(!config.disk_enabled());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: CacheEngineConfig =
            toml::from_str("content_cache = false\ndisk_size_mb = -1\n").unwrap();
        assert!(!config.content_cache);
        assert!(config.persistent_cache);
        assert_eq!(config.shard_size_mb, 64);
        assert_eq!(config.disk_size_mb, -1);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = CacheEngineConfig {
            disk_size_mb: 512,
            cache_path: PathBuf::from("/tmp/pcache"),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        let back: CacheEngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.disk_size_mb, 512);
        assert_eq!(back.cache_path, PathBuf::from("/tmp/pcache"));
    }
}
