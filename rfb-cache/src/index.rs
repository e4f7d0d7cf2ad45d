//! Persistent metadata index over shard payloads.
//!
//! A single `index.dat` file maps actual hashes to shard locators plus the
//! metadata needed to rebuild a [`crate::CachedEntry`] without touching the
//! payload. The file is a 34-byte header followed by packed 66-byte
//! [`WireIndexEntry`] records.
//!
//! # Header layout (big-endian)
//!
//! ```text
//! magic        [u8; 4]  "PCV3"
//! version      u16      current = 7
//! reserved     u16
//! entry count  u32
//! created at   u64      unix seconds
//! last access  u64      unix seconds
//! max shard id u16      highest shard id referenced when saved
//! reserved     [u8; 4]
//! ```
//!
//! Saves are atomic (write to `index.dat.tmp`, then rename). A load that
//! finds the wrong magic or an unsupported version renames the file to
//! `index.dat.bak` once and reports a fresh start; the caller then
//! garbage-collects the now-orphaned shards.

use crate::entry::ShardLocator;
use crate::error::Result;
use crate::quality::QualityCode;
use rfb_common::CacheKey;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Index file magic.
pub const INDEX_MAGIC: [u8; 4] = *b"PCV3";

/// Index format version.
pub const INDEX_VERSION: u16 = 7;

/// Fixed header size in bytes.
pub const INDEX_HEADER_LEN: usize = 34;

/// Packed record size in bytes. This is a format invariant.
pub const WIRE_INDEX_ENTRY_LEN: usize = 66;

/// Entry flag: lossy payload.
pub const INDEX_FLAG_LOSSY: u16 = 0x0001;

/// Entry flag: entry is persistable (always set for stored records).
pub const INDEX_FLAG_PERSISTABLE: u16 = 0x0002;

/// One packed index record.
///
/// ```text
/// actual     [u8; 16]
/// flags      u16       bit0 = lossy, bit1 = persistable
/// width      u32
/// height     u32
/// bpp        u16       source wire format bits per pixel
/// depth      u16       source wire format depth
/// quality    u16       3-bit quality code
/// shard id   u64
/// offset     u64
/// pf summary u8        packed endianness / colour / shift hints
/// reserved   u8
/// canonical  [u8; 16]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireIndexEntry {
    pub actual: CacheKey,
    pub flags: u16,
    pub width: u32,
    pub height: u32,
    pub bpp: u16,
    pub depth: u16,
    pub quality: u16,
    pub shard_id: u64,
    pub offset: u64,
    pub pf_summary: u8,
    pub canonical: CacheKey,
}

impl WireIndexEntry {
    /// True if the lossy flag is set.
    pub fn is_lossy(&self) -> bool {
        self.flags & INDEX_FLAG_LOSSY != 0
    }

    /// Payload length in bytes: entries store canonical 32bpp pixels
    /// tightly packed, so the length is derived from the geometry.
    pub fn payload_len(&self) -> u32 {
        self.width * self.height * 4
    }

    /// The shard locator this record points at.
    pub fn locator(&self) -> ShardLocator {
        ShardLocator {
            shard_id: self.shard_id as u16,
            offset: self.offset,
            length: self.payload_len(),
        }
    }

    /// The record's quality code.
    pub fn quality_code(&self) -> QualityCode {
        QualityCode::from_bits(self.quality as u8)
    }

    /// Encode into the packed 66-byte layout.
    pub fn encode(&self) -> [u8; WIRE_INDEX_ENTRY_LEN] {
        let mut buf = [0u8; WIRE_INDEX_ENTRY_LEN];
        buf[0..16].copy_from_slice(self.actual.as_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_be_bytes());
        buf[18..22].copy_from_slice(&self.width.to_be_bytes());
        buf[22..26].copy_from_slice(&self.height.to_be_bytes());
        buf[26..28].copy_from_slice(&self.bpp.to_be_bytes());
        buf[28..30].copy_from_slice(&self.depth.to_be_bytes());
        buf[30..32].copy_from_slice(&self.quality.to_be_bytes());
        buf[32..40].copy_from_slice(&self.shard_id.to_be_bytes());
        buf[40..48].copy_from_slice(&self.offset.to_be_bytes());
        buf[48] = self.pf_summary;
        // buf[49] reserved
        buf[50..66].copy_from_slice(self.canonical.as_bytes());
        buf
    }

    /// Decode from the packed layout.
    pub fn decode(buf: &[u8; WIRE_INDEX_ENTRY_LEN]) -> Self {
        Self {
            actual: CacheKey::from_bytes(buf[0..16].try_into().unwrap()),
            flags: u16::from_be_bytes(buf[16..18].try_into().unwrap()),
            width: u32::from_be_bytes(buf[18..22].try_into().unwrap()),
            height: u32::from_be_bytes(buf[22..26].try_into().unwrap()),
            bpp: u16::from_be_bytes(buf[26..28].try_into().unwrap()),
            depth: u16::from_be_bytes(buf[28..30].try_into().unwrap()),
            quality: u16::from_be_bytes(buf[30..32].try_into().unwrap()),
            shard_id: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            pf_summary: buf[48],
            canonical: CacheKey::from_bytes(buf[50..66].try_into().unwrap()),
        }
    }
}

/// Result of loading the index file.
#[derive(Debug)]
pub struct LoadedIndex {
    pub entries: Vec<WireIndexEntry>,
    /// Highest shard id recorded at save time.
    pub max_shard_id: u16,
    /// True when a stale or corrupt index forced an empty start; the
    /// caller must GC the shard directory.
    pub fresh_start: bool,
}

/// The `index.dat` reader/writer with dirty tracking.
pub struct IndexStore {
    path: PathBuf,
    created_at: u64,
    dirty: bool,
}

impl IndexStore {
    /// Create a store for `index.dat` under the cache directory.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join("index.dat"),
            created_at: unix_now(),
            dirty: false,
        }
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the in-memory entry set as ahead of the file.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// True if there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Load the index.
    ///
    /// A missing file yields an empty set. Wrong magic, unsupported
    /// version, or a truncated record section renames the file to
    /// `index.dat.bak` and yields an empty set with `fresh_start` set.
    pub fn load(&mut self) -> Result<LoadedIndex> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedIndex {
                    entries: Vec::new(),
                    max_shard_id: 0,
                    fresh_start: false,
                })
            }
            Err(e) => return Err(e.into()),
        };

        match self.parse(&bytes) {
            Ok(loaded) => Ok(loaded),
            Err(reason) => {
                tracing::warn!(%reason, "index rejected, starting fresh");
                let bak = self.path.with_extension("dat.bak");
                let _ = std::fs::rename(&self.path, bak);
                self.created_at = unix_now();
                Ok(LoadedIndex {
                    entries: Vec::new(),
                    max_shard_id: 0,
                    fresh_start: true,
                })
            }
        }
    }

    fn parse(&mut self, bytes: &[u8]) -> std::result::Result<LoadedIndex, String> {
        if bytes.len() < INDEX_HEADER_LEN {
            return Err(format!("file too short: {} bytes", bytes.len()));
        }
        if bytes[0..4] != INDEX_MAGIC {
            return Err("bad magic".into());
        }
        let version = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        if version != INDEX_VERSION {
            return Err(format!("version {version}, expected {INDEX_VERSION}"));
        }
        let count = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let created_at = u64::from_be_bytes(bytes[12..20].try_into().unwrap());
        let max_shard_id = u16::from_be_bytes(bytes[28..30].try_into().unwrap());

        let body = &bytes[INDEX_HEADER_LEN..];
        if body.len() != count * WIRE_INDEX_ENTRY_LEN {
            return Err(format!(
                "{} body bytes for {} records",
                body.len(),
                count
            ));
        }

        let mut entries = Vec::with_capacity(count);
        for chunk in body.chunks_exact(WIRE_INDEX_ENTRY_LEN) {
            let record: &[u8; WIRE_INDEX_ENTRY_LEN] = chunk.try_into().unwrap();
            entries.push(WireIndexEntry::decode(record));
        }

        self.created_at = created_at;
        self.dirty = false;
        Ok(LoadedIndex {
            entries,
            max_shard_id,
            fresh_start: false,
        })
    }

    /// Save the full entry set atomically (write to a temp file, then
    /// rename over `index.dat`). Clears the dirty flag on success.
    pub fn save(&mut self, entries: &[WireIndexEntry], max_shard_id: u16) -> Result<()> {
        let mut bytes =
            Vec::with_capacity(INDEX_HEADER_LEN + entries.len() * WIRE_INDEX_ENTRY_LEN);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes()); // reserved
        bytes.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.created_at.to_be_bytes());
        bytes.extend_from_slice(&unix_now().to_be_bytes()); // last access
        bytes.extend_from_slice(&max_shard_id.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 4]); // reserved
        debug_assert_eq!(bytes.len(), INDEX_HEADER_LEN);

        for entry in entries {
            bytes.extend_from_slice(&entry.encode());
        }

        let tmp = self.path.with_extension("dat.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
