//! Unified viewer cache.
//!
//! [`UnifiedCache`] combines the ARC core, the shard store, and the index
//! into the cache the decode orchestrator talks to. Entries are primarily
//! keyed by their **actual** hash; a secondary multimap resolves a
//! **canonical** hash to every actual payload held for it, with quality
//! tie-breaks (lossless beats lossy, deeper beats shallower, then most
//! recently used).
//!
//! Lookups never block on I/O: content that is only on disk reports a miss
//! and is queued for hydration; the foreground miss becomes a query to the
//! server, and the disk read happens at a later flush boundary.
//!
//! The cache is not internally synchronised. The enclosing session guards
//! each instance with a single mutex and keeps disk writes on one writer.

use crate::arc::ArcCache;
use crate::config::CacheEngineConfig;
use crate::entry::CachedEntry;
use crate::error::{CacheError, Result};
use crate::hash::{hash_canonical_tile, RectDigest};
use crate::index::{
    IndexStore, WireIndexEntry, INDEX_FLAG_LOSSY, INDEX_FLAG_PERSISTABLE,
};
use crate::quality::QualityCode;
use crate::shard::ShardStore;
use crate::stats::UnifiedCacheStats;
use bytes::Bytes;
use rfb_common::CacheKey;
use rfb_pixelbuffer::PixelFormat;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// Default number of cold entries pulled in per hydration batch.
pub const HYDRATE_BATCH: usize = 32;

/// Result of [`UnifiedCache::store_seed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedOutcome {
    /// Hash of the snapshotted pixels.
    pub actual: CacheKey,
    /// True when the snapshot differs from the canonical content (a hash
    /// report has been queued).
    pub lossy: bool,
}

/// Outcome of an insert, for the orchestrator's statistics.
#[derive(Debug, Default, Clone)]
pub struct InsertReport {
    /// Canonical hashes whose entries were evicted to make room.
    pub evicted: Vec<CacheKey>,
    /// An older same-key entry was displaced by the collision verifier.
    pub collision: bool,
}

struct DiskBacking {
    shards: ShardStore,
    index: IndexStore,
}

/// The viewer-side cache addressable by canonical or actual hash.
pub struct UnifiedCache {
    config: CacheEngineConfig,
    arc: ArcCache<CacheKey, CachedEntry>,
    /// canonical hash -> actual hashes of resident entries.
    by_canonical: HashMap<CacheKey, Vec<CacheKey>>,
    /// Evicted canonical hashes awaiting a wire eviction message.
    pending_evictions: Vec<CacheKey>,
    /// Missed canonical hashes awaiting a wire query message.
    pending_queries: Vec<CacheKey>,
    /// (canonical, actual) lossy mappings awaiting a hash report.
    pending_reports: Vec<(CacheKey, CacheKey)>,
    /// True once the PersistentCache protocol was negotiated this session.
    session_persist: bool,
    disk: Option<DiskBacking>,
    /// Indexed entries not yet hydrated into memory, by actual hash.
    cold: HashMap<CacheKey, WireIndexEntry>,
    /// canonical hash -> actual hashes of cold entries.
    cold_by_canonical: HashMap<CacheKey, Vec<CacheKey>>,
    /// Hydration order; misses move their key to the front.
    hydrate_queue: VecDeque<CacheKey>,
    /// Payload bytes believed to live in shards.
    disk_bytes: u64,
    hydrated: u64,
    collisions: u64,
}

fn entry_size(entry: &CachedEntry) -> usize {
    entry.byte_size()
}

impl UnifiedCache {
    /// Create a memory-only cache; call [`load_index`](Self::load_index)
    /// to attach the disk backing.
    pub fn new(config: CacheEngineConfig) -> Self {
        let capacity = config.memory_limit_bytes();
        Self {
            config,
            arc: ArcCache::new(capacity, entry_size),
            by_canonical: HashMap::new(),
            pending_evictions: Vec::new(),
            pending_queries: Vec::new(),
            pending_reports: Vec::new(),
            session_persist: false,
            disk: None,
            cold: HashMap::new(),
            cold_by_canonical: HashMap::new(),
            hydrate_queue: VecDeque::new(),
            disk_bytes: 0,
            hydrated: 0,
            collisions: 0,
        }
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheEngineConfig {
        &self.config
    }

    /// Record whether this session negotiated the PersistentCache
    /// protocol; entries only reach disk when it did.
    pub fn set_session_persistable(&mut self, enabled: bool) {
        self.session_persist = enabled;
    }

    /// Insert a decoded rectangle.
    ///
    /// `digest` is the actual-hash digest the caller computed from these
    /// pixels; `canonical` is the identity the server announced. Pixels
    /// arrive in the caller's format and are converted to the canonical
    /// domain before storage.
    ///
    /// # Errors
    ///
    /// [`CacheError::Uncacheable`] for zero-area rectangles or
    /// unrepresentable depths, [`CacheError::DimensionMismatch`] when the
    /// pixel slice does not match the declared geometry.
    pub fn insert(
        &mut self,
        canonical: CacheKey,
        digest: RectDigest,
        pixels: &[u8],
        pf: &PixelFormat,
        width: u32,
        height: u32,
        persistable: bool,
    ) -> Result<InsertReport> {
        if width == 0 || height == 0 {
            return Err(CacheError::Uncacheable("zero-area rectangle".into()));
        }
        let expected = width as usize * height as usize * pf.bytes_per_pixel() as usize;
        if pixels.len() != expected {
            return Err(CacheError::DimensionMismatch {
                given: pixels.len(),
                width,
                height,
            });
        }

        let canonical_pixels = to_canonical(pixels, pf, width, height);
        self.insert_canonical(
            canonical,
            digest,
            canonical_pixels,
            pf,
            width,
            height,
            persistable,
        )
    }

    /// Snapshot-driven insert: cache pixels the viewer already produced
    /// for this rectangle (the seed path). The actual hash is computed
    /// here; if it differs from `canonical` the entry is lossy and a hash
    /// report is queued.
    pub fn store_seed(
        &mut self,
        canonical: CacheKey,
        pixels: &[u8],
        pf: &PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<SeedOutcome> {
        if width == 0 || height == 0 {
            return Err(CacheError::Uncacheable("zero-area rectangle".into()));
        }
        let expected = width as usize * height as usize * pf.bytes_per_pixel() as usize;
        if pixels.len() != expected {
            return Err(CacheError::DimensionMismatch {
                given: pixels.len(),
                width,
                height,
            });
        }

        let canonical_pixels = to_canonical(pixels, pf, width, height);
        let digest = hash_canonical_tile(width, height, &canonical_pixels);
        let lossy = digest.key != canonical;
        if lossy {
            self.pending_reports.push((canonical, digest.key));
        }
        // The hash is exact (we computed it from the stored pixels), so
        // seeds are persistable even when lossy.
        self.insert_canonical(
            canonical,
            digest,
            canonical_pixels,
            pf,
            width,
            height,
            true,
        )?;
        Ok(SeedOutcome {
            actual: digest.key,
            lossy,
        })
    }

    fn insert_canonical(
        &mut self,
        canonical: CacheKey,
        digest: RectDigest,
        canonical_pixels: Vec<u8>,
        pf: &PixelFormat,
        width: u32,
        height: u32,
        persistable: bool,
    ) -> Result<InsertReport> {
        let actual = digest.key;
        let lossy = actual != canonical;
        let quality = QualityCode::new(lossy, pf.bits_per_pixel)?;
        let mut report = InsertReport::default();

        // Same actual hash, same geometry, different content: the short
        // verifier catches the collision; the newer entry wins.
        let collides = self.arc.peek(&actual).is_some_and(|existing| {
            existing.width == width
                && existing.height == height
                && existing.verifier != digest.verifier
        });
        if collides {
            tracing::warn!(%actual, "content hash collision, replacing older entry");
            self.collisions += 1;
            report.collision = true;
            if let Some(old) = self.arc.remove(&actual) {
                self.unmap_canonical(&old.canonical, &actual);
                if old.locator.is_some() {
                    self.disk_bytes =
                        self.disk_bytes.saturating_sub(old.payload_len() as u64);
                    self.mark_index_dirty();
                }
            }
        }

        let mut entry = CachedEntry {
            canonical,
            actual,
            width,
            height,
            source_bpp: pf.bits_per_pixel as u16,
            source_depth: pf.depth as u16,
            pixels: Bytes::from(canonical_pixels),
            quality,
            persistable,
            verifier: digest.verifier,
            last_used: Instant::now(),
            locator: None,
        };

        self.maybe_persist(&mut entry);

        let evicted = self.arc.insert(actual, entry);
        for (ev_actual, ev_entry) in evicted {
            self.on_evicted(ev_actual, ev_entry, &mut report);
        }

        // The ARC rejects entries bigger than its whole capacity; only map
        // what actually went resident.
        if self.arc.contains(&actual) {
            self.map_canonical(canonical, actual);
            if !lossy {
                self.drop_lossy_siblings(canonical, &actual);
            }
        }

        Ok(report)
    }

    /// Direct lookup by actual hash. Dimensions must match exactly.
    pub fn get_by_actual(
        &mut self,
        actual: &CacheKey,
        width: u32,
        height: u32,
    ) -> Option<CachedEntry> {
        if let Some(entry) = self.arc.get_mut(actual) {
            if entry.width == width && entry.height == height {
                entry.touch();
                return Some(entry.clone());
            }
            return None;
        }
        if self.cold.contains_key(actual) {
            self.queue_hydration(*actual);
        }
        None
    }

    /// Lookup by canonical hash: the highest-quality resident entry for
    /// the geometry, requiring at least `min_bpp` of source depth.
    /// Tie-break: lossless > lossy, deeper > shallower, then most
    /// recently used.
    pub fn get_by_canonical(
        &mut self,
        canonical: &CacheKey,
        width: u32,
        height: u32,
        min_bpp: u8,
    ) -> Option<CachedEntry> {
        let candidates: Vec<CacheKey> = self
            .by_canonical
            .get(canonical)
            .map(|keys| keys.clone())
            .unwrap_or_default();

        let mut best: Option<(u8, Instant, CacheKey)> = None;
        for actual in candidates {
            if let Some(entry) = self.arc.peek(&actual) {
                if !entry.matches(width, height, min_bpp) {
                    continue;
                }
                let rank = (entry.quality.rank(), entry.last_used, actual);
                let replace = match &best {
                    Some((r, t, _)) => (rank.0, rank.1) > (*r, *t),
                    None => true,
                };
                if replace {
                    best = Some(rank);
                }
            }
        }

        if let Some((_, _, actual)) = best {
            if let Some(entry) = self.arc.get_mut(&actual) {
                entry.touch();
                return Some(entry.clone());
            }
        }

        // Nothing resident; a cold entry satisfying the lookup is queued
        // for hydration but still reports a miss (no foreground I/O).
        if let Some(cold_keys) = self.cold_by_canonical.get(canonical) {
            let matching = cold_keys.iter().copied().find(|actual| {
                self.cold.get(actual).is_some_and(|meta| {
                    meta.width == width
                        && meta.height == height
                        && meta.quality_code().meets_min_bpp(min_bpp)
                })
            });
            if let Some(actual) = matching {
                self.queue_hydration(actual);
            }
        }
        None
    }

    /// Queue a wire eviction for a canonical hash.
    pub fn record_eviction(&mut self, canonical: CacheKey) {
        self.pending_evictions.push(canonical);
    }

    /// Queue a query for a canonical hash the server must re-send.
    /// Duplicates within one batch are suppressed.
    pub fn note_query(&mut self, canonical: CacheKey) {
        if !self.pending_queries.contains(&canonical) {
            self.pending_queries.push(canonical);
        }
    }

    /// Queue a lossy hash report.
    pub fn note_hash_report(&mut self, canonical: CacheKey, actual: CacheKey) {
        self.pending_reports.push((canonical, actual));
    }

    /// Take the queued evictions (canonical hashes).
    pub fn drain_pending_evictions(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.pending_evictions)
    }

    /// Take the queued queries (canonical hashes).
    pub fn drain_pending_queries(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.pending_queries)
    }

    /// Take the queued lossy hash reports.
    pub fn drain_pending_reports(&mut self) -> Vec<(CacheKey, CacheKey)> {
        std::mem::take(&mut self.pending_reports)
    }

    /// Handle the "clear all" reference: drop live entries, cold mirrors,
    /// and every pending queue. Shard files stay on disk until the next
    /// index save and GC rewrite history to match.
    pub fn clear_session(&mut self) {
        self.arc.clear();
        self.by_canonical.clear();
        self.cold.clear();
        self.cold_by_canonical.clear();
        self.hydrate_queue.clear();
        self.pending_evictions.clear();
        self.pending_queries.clear();
        self.pending_reports.clear();
        self.disk_bytes = 0;
        if let Some(disk) = &mut self.disk {
            disk.index.mark_dirty();
        }
        tracing::info!("session cache cleared");
    }

    /// Attach the disk backing: load `index.dat`, register cold entries
    /// for lazy hydration, and GC shards the index no longer references.
    pub fn load_index(&mut self) -> Result<()> {
        if !self.config.disk_enabled() {
            return Err(CacheError::DiskDisabled);
        }
        let dir = self.config.cache_path.clone();
        std::fs::create_dir_all(&dir)?;
        let mut index = IndexStore::new(&dir);
        let loaded = index.load()?;

        let first_free = loaded
            .entries
            .iter()
            .map(|e| e.shard_id as u16)
            .max()
            .unwrap_or(loaded.max_shard_id)
            .wrapping_add(1);
        let mut shards = ShardStore::open(&dir, self.config.shard_limit_bytes(), first_free)?;

        let live: HashSet<u16> = loaded.entries.iter().map(|e| e.shard_id as u16).collect();
        shards.gc(&live)?;

        for meta in loaded.entries {
            self.disk_bytes += meta.payload_len() as u64;
            self.cold_by_canonical
                .entry(meta.canonical)
                .or_default()
                .push(meta.actual);
            self.hydrate_queue.push_back(meta.actual);
            self.cold.insert(meta.actual, meta);
        }

        tracing::info!(
            cold = self.cold.len(),
            fresh_start = loaded.fresh_start,
            "persistent cache index loaded"
        );
        self.disk = Some(DiskBacking { shards, index });
        Ok(())
    }

    /// Write the full index (resident persistable entries plus cold
    /// records) atomically.
    pub fn save_index(&mut self) -> Result<()> {
        let records = self.collect_index_records();
        let max_shard = records
            .iter()
            .map(|r| r.shard_id as u16)
            .max()
            .unwrap_or(0);
        let disk = self.disk.as_mut().ok_or(CacheError::DiskDisabled)?;
        disk.index.save(&records, max_shard)?;
        Ok(())
    }

    /// Persist the index if anything changed since the last save.
    pub fn flush_dirty_index(&mut self) -> Result<()> {
        if self.disk.as_ref().is_some_and(|d| d.index.is_dirty()) {
            self.save_index()?;
        }
        Ok(())
    }

    /// Read up to `max` cold payloads back into memory. Returns how many
    /// entries were hydrated; unreadable records are dropped and count as
    /// ordinary misses.
    pub fn hydrate_next_batch(&mut self, max: usize) -> usize {
        let mut done = 0;
        while done < max {
            let Some(actual) = self.hydrate_queue.pop_front() else {
                break;
            };
            let Some(meta) = self.cold.get(&actual).copied() else {
                continue; // already hydrated or dropped
            };
            let Some(disk) = &self.disk else { break };

            let payload = match disk.shards.read(&meta.locator(), &actual) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(%actual, error = %e, "hydration failed, dropping record");
                    self.remove_cold(&actual);
                    self.mark_index_dirty();
                    continue;
                }
            };

            let digest = hash_canonical_tile(meta.width, meta.height, &payload);
            if digest.key != actual {
                tracing::warn!(%actual, "shard payload does not match its hash, dropping");
                self.remove_cold(&actual);
                self.mark_index_dirty();
                continue;
            }

            let entry = CachedEntry {
                canonical: meta.canonical,
                actual,
                width: meta.width,
                height: meta.height,
                source_bpp: meta.bpp,
                source_depth: meta.depth,
                pixels: Bytes::from(payload),
                quality: meta.quality_code(),
                persistable: true,
                verifier: digest.verifier,
                last_used: Instant::now(),
                locator: Some(meta.locator()),
            };
            self.remove_cold(&actual);
            // Cold-to-resident promotion: the payload stays referenced via
            // the entry's locator, so the disk accounting is restored.
            self.disk_bytes += meta.payload_len() as u64;

            let canonical = entry.canonical;
            let evicted = self.arc.insert(actual, entry);
            let mut scratch = InsertReport::default();
            for (ev_actual, ev_entry) in evicted {
                self.on_evicted(ev_actual, ev_entry, &mut scratch);
            }
            self.map_canonical(canonical, actual);
            self.hydrated += 1;
            done += 1;
        }
        done
    }

    /// Content ids (canonical prefixes) of everything this cache can
    /// serve, resident and cold, for the reconnect hash-list
    /// advertisement.
    pub fn advertised_content_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .arc
            .iter()
            .map(|(_, entry)| entry.canonical.content_id())
            .chain(self.cold.values().map(|meta| meta.canonical.content_id()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// True if an entry for this actual hash is resident.
    pub fn contains_actual(&self, actual: &CacheKey) -> bool {
        self.arc.contains(actual)
    }

    /// Counters and gauges.
    pub fn stats(&self) -> UnifiedCacheStats {
        let lossy_entries = self
            .arc
            .iter()
            .filter(|(_, entry)| !entry.is_lossless())
            .count();
        UnifiedCacheStats {
            arc: self.arc.stats(),
            entries: self.arc.len(),
            lossy_entries,
            cold_entries: self.cold.len(),
            hydrated: self.hydrated,
            collisions: self.collisions,
            pending_evictions: self.pending_evictions.len(),
            pending_queries: self.pending_queries.len(),
        }
    }

    // -- internals ---------------------------------------------------------

    /// Append the payload to a shard if this entry, this session, and the
    /// disk budget all allow it. Write failures demote the entry to
    /// non-persistable and never propagate.
    fn maybe_persist(&mut self, entry: &mut CachedEntry) {
        if !entry.persistable || !self.session_persist {
            return;
        }
        let Some(limit) = self.config.disk_limit_bytes() else {
            return;
        };
        let Some(disk) = &mut self.disk else { return };

        if self.disk_bytes + entry.payload_len() as u64 > limit {
            tracing::debug!("disk budget exhausted, keeping entry memory-only");
            entry.persistable = false;
            return;
        }

        match disk.shards.append(
            &entry.actual,
            &entry.canonical,
            !entry.is_lossless(),
            &entry.pixels,
        ) {
            Ok(locator) => {
                entry.locator = Some(locator);
                self.disk_bytes += entry.payload_len() as u64;
                disk.index.mark_dirty();
            }
            Err(e) => {
                tracing::warn!(error = %e, "shard append failed, entry kept memory-only");
                entry.persistable = false;
            }
        }
    }

    /// Bookkeeping for an entry the ARC pushed out: the canonical mapping
    /// is dropped, a wire eviction is queued, and any disk record is
    /// forgotten (the shard bytes become garbage until the next GC).
    fn on_evicted(&mut self, actual: CacheKey, entry: CachedEntry, report: &mut InsertReport) {
        self.unmap_canonical(&entry.canonical, &actual);
        if entry.locator.is_some() {
            self.disk_bytes = self.disk_bytes.saturating_sub(entry.payload_len() as u64);
            self.mark_index_dirty();
        }
        self.record_eviction(entry.canonical);
        report.evicted.push(entry.canonical);
    }

    /// After a lossless insert, lossy payloads for the same canonical stop
    /// being persisted: their disk records are dropped while the in-memory
    /// entries stay (lookups prefer the lossless one anyway). No wire
    /// eviction: the server can still reference the canonical hash.
    fn drop_lossy_siblings(&mut self, canonical: CacheKey, keep: &CacheKey) {
        let siblings: Vec<CacheKey> = self
            .by_canonical
            .get(&canonical)
            .map(|keys| {
                keys.iter()
                    .copied()
                    .filter(|actual| actual != keep)
                    .collect()
            })
            .unwrap_or_default();
        for actual in siblings {
            let mut dropped_payload = 0u64;
            if let Some(entry) = self.arc.peek_mut(&actual) {
                if !entry.is_lossless() && entry.locator.take().is_some() {
                    entry.persistable = false;
                    dropped_payload = entry.payload_len() as u64;
                }
            }
            if dropped_payload > 0 {
                tracing::debug!(%canonical, "lossless upgrade, lossy sibling leaves disk");
                self.disk_bytes = self.disk_bytes.saturating_sub(dropped_payload);
                self.mark_index_dirty();
            }
        }
        // Cold lossy records for this canonical have no in-memory entry to
        // keep; they are simply forgotten.
        let cold_siblings: Vec<CacheKey> = self
            .cold_by_canonical
            .get(&canonical)
            .map(|keys| {
                keys.iter()
                    .copied()
                    .filter(|actual| {
                        actual != keep
                            && self.cold.get(actual).is_some_and(|meta| meta.is_lossy())
                    })
                    .collect()
            })
            .unwrap_or_default();
        for actual in cold_siblings {
            self.remove_cold(&actual);
            self.mark_index_dirty();
        }
    }

    fn map_canonical(&mut self, canonical: CacheKey, actual: CacheKey) {
        let keys = self.by_canonical.entry(canonical).or_default();
        if !keys.contains(&actual) {
            keys.push(actual);
        }
    }

    fn unmap_canonical(&mut self, canonical: &CacheKey, actual: &CacheKey) {
        if let Some(keys) = self.by_canonical.get_mut(canonical) {
            keys.retain(|k| k != actual);
            if keys.is_empty() {
                self.by_canonical.remove(canonical);
            }
        }
    }

    fn remove_cold(&mut self, actual: &CacheKey) {
        if let Some(meta) = self.cold.remove(actual) {
            self.disk_bytes = self.disk_bytes.saturating_sub(meta.payload_len() as u64);
            if let Some(keys) = self.cold_by_canonical.get_mut(&meta.canonical) {
                keys.retain(|k| k != actual);
                if keys.is_empty() {
                    self.cold_by_canonical.remove(&meta.canonical);
                }
            }
        }
    }

    fn drop_index_record(&mut self, actual: &CacheKey) {
        self.remove_cold(actual);
        self.mark_index_dirty();
    }

    fn mark_index_dirty(&mut self) {
        if let Some(disk) = &mut self.disk {
            disk.index.mark_dirty();
        }
    }

    fn queue_hydration(&mut self, actual: CacheKey) {
        // Misses jump the queue so the content a reference just asked for
        // hydrates first.
        if let Some(pos) = self.hydrate_queue.iter().position(|k| *k == actual) {
            self.hydrate_queue.remove(pos);
        }
        self.hydrate_queue.push_front(actual);
    }

    fn collect_index_records(&self) -> Vec<WireIndexEntry> {
        let mut records: Vec<WireIndexEntry> = self
            .arc
            .iter()
            .filter_map(|(actual, entry)| {
                let locator = entry.locator?;
                if !entry.persistable {
                    return None;
                }
                let mut flags = INDEX_FLAG_PERSISTABLE;
                if !entry.is_lossless() {
                    flags |= INDEX_FLAG_LOSSY;
                }
                Some(WireIndexEntry {
                    actual: *actual,
                    flags,
                    width: entry.width,
                    height: entry.height,
                    bpp: entry.source_bpp,
                    depth: entry.source_depth,
                    quality: entry.quality.bits() as u16,
                    shard_id: locator.shard_id as u64,
                    offset: locator.offset,
                    pf_summary: PixelFormat::canonical().summary(),
                    canonical: entry.canonical,
                })
            })
            .collect();
        records.extend(self.cold.values().copied());
        records
    }
}

/// Convert a tightly packed pixel slice into the canonical domain.
fn to_canonical(pixels: &[u8], pf: &PixelFormat, width: u32, height: u32) -> Vec<u8> {
    if pf.is_canonical() {
        return pixels.to_vec();
    }
    let src_bpp = pf.bytes_per_pixel() as usize;
    let canonical = PixelFormat::canonical();
    let mut out = Vec::with_capacity(width as usize * height as usize * 4);
    for chunk in pixels.chunks_exact(src_bpp).take(width as usize * height as usize) {
        let rgba = pf.to_rgb888(chunk);
        out.extend_from_slice(&canonical.from_rgb888(rgba));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_canonical_tile;

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 16])
    }

    fn mem_config(mb: usize) -> CacheEngineConfig {
        CacheEngineConfig {
            persistent_cache_size_mb: mb,
            disk_size_mb: -1,
            ..Default::default()
        }
    }

    fn tile(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            px[0] = seed.wrapping_add(i as u8);
            px[1] = seed;
            px[2] = 0x40;
            px[3] = 0;
        }
        pixels
    }

    fn insert_tile(
        cache: &mut UnifiedCache,
        canonical: CacheKey,
        width: u32,
        height: u32,
        seed: u8,
    ) -> RectDigest {
        let pixels = tile(width, height, seed);
        let digest = hash_canonical_tile(width, height, &pixels);
        cache
            .insert(
                canonical,
                digest,
                &pixels,
                &PixelFormat::canonical(),
                width,
                height,
                true,
            )
            .unwrap();
        digest
    }

    #[test]
    fn test_insert_and_get_by_actual() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let digest = insert_tile(&mut cache, key(1), 8, 8, 7);

        let entry = cache.get_by_actual(&digest.key, 8, 8).unwrap();
        assert_eq!(entry.canonical, key(1));
        assert!(cache.get_by_actual(&digest.key, 8, 9).is_none()); // wrong dims
    }

    #[test]
    fn test_get_by_canonical_resolves_lossy_mapping() {
        let mut cache = UnifiedCache::new(mem_config(16));
        // Entry whose actual differs from the announced canonical (lossy).
        let digest = insert_tile(&mut cache, key(1), 8, 8, 7);
        assert_ne!(digest.key, key(1));

        let entry = cache.get_by_canonical(&key(1), 8, 8, 0).unwrap();
        assert_eq!(entry.actual, digest.key);
        assert!(!entry.is_lossless());
    }

    #[test]
    fn test_quality_monotonicity() {
        // P8: with a lossless and a lossy entry live for the same
        // canonical, getByCanonical returns the lossless one. Build the
        // lossless entry so its actual equals the canonical.
        let mut cache = UnifiedCache::new(mem_config(16));
        let pixels = tile(8, 8, 3);
        let digest = hash_canonical_tile(8, 8, &pixels);
        let canonical = digest.key;

        // Lossy variant first (different pixels, announced under the same
        // canonical). Use an 8 bpp source so depth also differs.
        let lossy_pixels = tile(8, 8, 200);
        let lossy_digest = hash_canonical_tile(8, 8, &lossy_pixels);
        cache
            .insert(
                canonical,
                lossy_digest,
                &lossy_pixels,
                &PixelFormat::canonical(),
                8,
                8,
                true,
            )
            .unwrap();

        let got = cache.get_by_canonical(&canonical, 8, 8, 0).unwrap();
        assert!(!got.is_lossless());

        // Now the lossless payload arrives.
        cache
            .insert(
                canonical,
                digest,
                &pixels,
                &PixelFormat::canonical(),
                8,
                8,
                true,
            )
            .unwrap();
        let got = cache.get_by_canonical(&canonical, 8, 8, 0).unwrap();
        assert!(got.is_lossless());
        assert_eq!(got.actual, canonical);
        // Both entries coexist in memory; the lossless one wins lookups.
        assert!(cache.contains_actual(&lossy_digest.key));
        assert!(cache.get_by_actual(&lossy_digest.key, 8, 8).is_some());
        // And no wire eviction was queued by the upgrade.
        assert!(cache.drain_pending_evictions().is_empty());
    }

    #[test]
    fn test_min_bpp_filter_skips_shallow_entries() {
        let mut cache = UnifiedCache::new(mem_config(16));
        // 8 bpp source: depth class 0.
        let pf8 = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_color: true,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 5,
            green_shift: 2,
            blue_shift: 0,
        };
        let pixels8 = vec![0x5Au8; 8 * 8];
        let canon8 = to_canonical(&pixels8, &pf8, 8, 8);
        let digest = hash_canonical_tile(8, 8, &canon8);
        cache
            .insert(key(1), digest, &pixels8, &pf8, 8, 8, true)
            .unwrap();

        assert!(cache.get_by_canonical(&key(1), 8, 8, 32).is_none());
        assert!(cache.get_by_canonical(&key(1), 8, 8, 8).is_some());
    }

    #[test]
    fn test_depth_upgrade_after_quality_miss() {
        // Only a shallow lossy entry exists; a 32 bpp session's lookup
        // misses, the queried 32 bpp payload arrives, and both entries
        // then coexist with the deep lossless one preferred.
        let mut cache = UnifiedCache::new(mem_config(16));
        let pf8 = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_color: true,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 5,
            green_shift: 2,
            blue_shift: 0,
        };
        let pixels = tile(8, 8, 11);
        let digest = hash_canonical_tile(8, 8, &pixels);
        let canonical = digest.key;

        let pixels8 = vec![0x5Au8; 8 * 8];
        let canon8 = to_canonical(&pixels8, &pf8, 8, 8);
        let digest8 = hash_canonical_tile(8, 8, &canon8);
        cache
            .insert(canonical, digest8, &pixels8, &pf8, 8, 8, true)
            .unwrap();

        // 32 bpp lookup misses and queues a query.
        assert!(cache.get_by_canonical(&canonical, 8, 8, 32).is_none());
        cache.note_query(canonical);
        assert_eq!(cache.drain_pending_queries(), vec![canonical]);

        // The queried lossless 32 bpp init arrives.
        cache
            .insert(
                canonical,
                digest,
                &pixels,
                &PixelFormat::canonical(),
                8,
                8,
                true,
            )
            .unwrap();
        assert!(cache.contains_actual(&digest8.key));
        assert!(cache.contains_actual(&canonical));
        let got = cache.get_by_canonical(&canonical, 8, 8, 32).unwrap();
        assert!(got.is_lossless());
        assert_eq!(got.source_bpp, 32);
    }

    #[test]
    fn test_eviction_queues_wire_notification() {
        // 1 MB cap; six 256x256x4 tiles (256 KiB each) must evict.
        let mut cache = UnifiedCache::new(mem_config(1));
        for seed in 0..6u8 {
            insert_tile(&mut cache, key(seed + 1), 256, 256, seed);
        }
        let evictions = cache.drain_pending_evictions();
        assert!(!evictions.is_empty());
        // Evictions carry canonical hashes.
        assert!(evictions.iter().all(|k| k.as_bytes()[0] <= 6));
        assert!(cache.drain_pending_evictions().is_empty()); // drained
    }

    #[test]
    fn test_zero_area_uncacheable() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let digest = hash_canonical_tile(1, 1, &[0, 0, 0, 0]);
        let result = cache.insert(
            key(1),
            digest,
            &[],
            &PixelFormat::canonical(),
            0,
            4,
            true,
        );
        assert!(matches!(result, Err(CacheError::Uncacheable(_))));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let pixels = tile(4, 4, 1);
        let digest = hash_canonical_tile(4, 4, &pixels);
        let result = cache.insert(
            key(1),
            digest,
            &pixels,
            &PixelFormat::canonical(),
            8,
            8,
            true,
        );
        assert!(matches!(result, Err(CacheError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_store_seed_lossless_no_report() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let pixels = tile(8, 8, 5);
        let digest = hash_canonical_tile(8, 8, &pixels);

        let outcome = cache
            .store_seed(digest.key, &pixels, &PixelFormat::canonical(), 8, 8)
            .unwrap();
        assert!(!outcome.lossy);
        assert_eq!(outcome.actual, digest.key);
        assert!(cache.drain_pending_reports().is_empty());
    }

    #[test]
    fn test_store_seed_lossy_queues_report() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let pixels = tile(8, 8, 5);
        let canonical = key(0x77); // differs from the snapshot hash

        let outcome = cache
            .store_seed(canonical, &pixels, &PixelFormat::canonical(), 8, 8)
            .unwrap();
        assert!(outcome.lossy);
        let reports = cache.drain_pending_reports();
        assert_eq!(reports, vec![(canonical, outcome.actual)]);

        // P6: a subsequent reference by canonical finds the entry.
        assert!(cache.get_by_canonical(&canonical, 8, 8, 0).is_some());
    }

    #[test]
    fn test_query_dedupe() {
        let mut cache = UnifiedCache::new(mem_config(16));
        cache.note_query(key(1));
        cache.note_query(key(1));
        cache.note_query(key(2));
        assert_eq!(cache.drain_pending_queries(), vec![key(1), key(2)]);
    }

    #[test]
    fn test_clear_session() {
        let mut cache = UnifiedCache::new(mem_config(16));
        insert_tile(&mut cache, key(1), 8, 8, 1);
        cache.note_query(key(9));
        cache.clear_session();
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.drain_pending_queries().is_empty());
        assert!(cache.get_by_canonical(&key(1), 8, 8, 0).is_none());
    }

    #[test]
    fn test_collision_verifier_replaces_older_entry() {
        let mut cache = UnifiedCache::new(mem_config(16));
        let pixels_a = tile(8, 8, 1);
        let pixels_b = tile(8, 8, 2);
        let digest_a = hash_canonical_tile(8, 8, &pixels_a);
        // Forge a digest that collides on the key but differs in content.
        let forged = RectDigest {
            key: digest_a.key,
            verifier: digest_a.verifier.wrapping_add(1),
        };

        cache
            .insert(
                key(1),
                digest_a,
                &pixels_a,
                &PixelFormat::canonical(),
                8,
                8,
                true,
            )
            .unwrap();
        let report = cache
            .insert(
                key(1),
                forged,
                &pixels_b,
                &PixelFormat::canonical(),
                8,
                8,
                true,
            )
            .unwrap();
        assert!(report.collision);
        assert_eq!(cache.stats().collisions, 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_advertised_ids_cover_resident_entries() {
        let mut cache = UnifiedCache::new(mem_config(16));
        insert_tile(&mut cache, key(1), 8, 8, 1);
        insert_tile(&mut cache, key(2), 8, 8, 2);
        let ids = cache.advertised_content_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&key(1).content_id()));
    }
}
