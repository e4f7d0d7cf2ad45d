//! Per-client cache state.
//!
//! One [`ClientCacheTracker`] lives with each connection and mirrors what
//! that client is known to hold: the canonical hashes sent via init or
//! seed, the lossy `canonical -> actual` mappings the client reported, and
//! the last bounds each key was drawn at (for targeted refresh after a
//! miss). Keys leave the tracker only through client eviction messages or
//! when the connection drops with the tracker.
//!
//! The tracker is accessed only by its connection's task; no locking.

use rfb_common::{CacheKey, Rect};
use rfb_protocol::messages::cache::{ClientCacheMessage, PersistentHashList};
use std::collections::{HashMap, HashSet};

/// Capabilities the client advertised in SetEncodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCapabilities {
    pub content_cache: bool,
    pub persistent_cache: bool,
}

/// What the tracker wants done after digesting a client message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrackerAction {
    /// Canonical keys to re-send as inits (query replies).
    pub resend: Vec<CacheKey>,
    /// Content ids that still need resolving to full keys (session-scoped
    /// RequestCachedData); the encode orchestrator owns that lookup.
    pub resend_ids: Vec<u64>,
}

/// Reassembles chunked hash-list advertisements.
///
/// Chunks may interleave and arrive out of order within one sequence; a
/// chunk from a different sequence id abandons the old one.
#[derive(Debug, Default)]
struct HashListAssembler {
    sequence_id: Option<u32>,
    total_chunks: u16,
    chunks: HashMap<u16, Vec<u64>>,
}

impl HashListAssembler {
    /// Feed one chunk; returns the full id list once every chunk of the
    /// sequence has arrived.
    fn offer(&mut self, msg: &PersistentHashList) -> Option<Vec<u64>> {
        if self.sequence_id != Some(msg.sequence_id) {
            if self.sequence_id.is_some() {
                tracing::debug!(
                    old = ?self.sequence_id,
                    new = msg.sequence_id,
                    "hash list sequence superseded"
                );
            }
            self.sequence_id = Some(msg.sequence_id);
            self.total_chunks = msg.total_chunks;
            self.chunks.clear();
        }
        self.chunks.insert(msg.chunk_index, msg.content_ids.clone());
        if self.chunks.len() == self.total_chunks as usize {
            let total = self.total_chunks;
            self.sequence_id = None;
            let mut ids = Vec::new();
            for index in 0..total {
                if let Some(chunk) = self.chunks.remove(&index) {
                    ids.extend(chunk);
                }
            }
            self.chunks.clear();
            Some(ids)
        } else {
            None
        }
    }
}

/// Mirror of one client's cache contents.
#[derive(Debug)]
pub struct ClientCacheTracker {
    caps: ClientCapabilities,
    /// Canonical hashes sent to this client via init or seed.
    known_keys: HashSet<CacheKey>,
    /// Content-id prefixes of everything known (covers hash-list entries,
    /// whose full keys the advertisement does not carry).
    known_ids: HashSet<u64>,
    /// Lossy mappings reported by the client.
    lossy_map: HashMap<CacheKey, CacheKey>,
    /// Last bounds each key was drawn at.
    last_rect_by_key: HashMap<CacheKey, Rect>,
    updates_sent: u64,
    assembler: HashListAssembler,
}

impl ClientCacheTracker {
    pub fn new(caps: ClientCapabilities) -> Self {
        Self {
            caps,
            known_keys: HashSet::new(),
            known_ids: HashSet::new(),
            lossy_map: HashMap::new(),
            last_rect_by_key: HashMap::new(),
            updates_sent: 0,
            assembler: HashListAssembler::default(),
        }
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.caps
    }

    /// Can this client take cache messages at all?
    pub fn supports_cache(&self) -> bool {
        self.caps.content_cache || self.caps.persistent_cache
    }

    /// Should full-key (persistent) envelopes be used?
    pub fn persistent(&self) -> bool {
        self.caps.persistent_cache
    }

    /// Is the client believed to hold this canonical content?
    pub fn knows(&self, canonical: &CacheKey) -> bool {
        self.known_keys.contains(canonical)
            || self.known_ids.contains(&canonical.content_id())
            || self.lossy_map.contains_key(canonical)
    }

    /// Record that an init or seed for `canonical` went out at `rect`.
    pub fn note_sent(&mut self, canonical: CacheKey, rect: Rect) {
        self.known_keys.insert(canonical);
        self.known_ids.insert(canonical.content_id());
        self.last_rect_by_key.insert(canonical, rect);
    }

    /// Last bounds this key was drawn at, if remembered.
    pub fn last_rect(&self, canonical: &CacheKey) -> Option<Rect> {
        self.last_rect_by_key.get(canonical).copied()
    }

    /// Count a framebuffer update; returns the new total for periodic
    /// logging by the caller.
    pub fn note_update_sent(&mut self) -> u64 {
        self.updates_sent += 1;
        if self.updates_sent % 100 == 0 {
            tracing::debug!(
                updates = self.updates_sent,
                known = self.known_keys.len(),
                lossy = self.lossy_map.len(),
                "client cache tracker"
            );
        }
        self.updates_sent
    }

    /// Number of keys currently believed held.
    pub fn known_len(&self) -> usize {
        self.known_ids.len().max(self.known_keys.len())
    }

    /// Digest one client cache message.
    pub fn handle_message(&mut self, msg: &ClientCacheMessage) -> TrackerAction {
        let mut action = TrackerAction::default();
        match msg {
            ClientCacheMessage::CacheEviction(eviction) => {
                for id in &eviction.content_ids {
                    self.forget_id(*id);
                }
            }
            ClientCacheMessage::PersistentCacheEviction(eviction) => {
                for key in &eviction.keys {
                    self.forget_key(key);
                }
            }
            ClientCacheMessage::HashReport(report) => {
                self.lossy_map.insert(report.canonical, report.actual);
                // The client can now answer references for this canonical.
                self.known_ids.insert(report.canonical.content_id());
            }
            ClientCacheMessage::PersistentCacheQuery(query) => {
                action.resend.extend(query.keys.iter().copied());
            }
            ClientCacheMessage::RequestCachedData(request) => {
                action.resend_ids.push(request.content_id);
            }
            ClientCacheMessage::PersistentHashList(list) => {
                if let Some(ids) = self.assembler.offer(list) {
                    tracing::info!(count = ids.len(), "client advertised persisted entries");
                    self.known_ids.extend(ids);
                }
            }
        }
        action
    }

    fn forget_key(&mut self, canonical: &CacheKey) {
        self.known_keys.remove(canonical);
        self.known_ids.remove(&canonical.content_id());
        self.lossy_map.remove(canonical);
        self.last_rect_by_key.remove(canonical);
    }

    fn forget_id(&mut self, content_id: u64) {
        self.known_ids.remove(&content_id);
        self.known_keys.retain(|key| key.content_id() != content_id);
        self.lossy_map.retain(|key, _| key.content_id() != content_id);
        self.last_rect_by_key
            .retain(|key, _| key.content_id() != content_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_protocol::messages::cache::{
        CacheEviction, PersistentCacheEviction, PersistentCacheHashReport, PersistentCacheQuery,
        RequestCachedData,
    };

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 16])
    }

    fn both() -> ClientCapabilities {
        ClientCapabilities {
            content_cache: true,
            persistent_cache: true,
        }
    }

    #[test]
    fn test_note_sent_then_knows() {
        let mut tracker = ClientCacheTracker::new(both());
        assert!(!tracker.knows(&key(1)));
        tracker.note_sent(key(1), Rect::new(0, 0, 64, 64));
        assert!(tracker.knows(&key(1)));
        assert_eq!(tracker.last_rect(&key(1)), Some(Rect::new(0, 0, 64, 64)));
    }

    #[test]
    fn test_persistent_eviction_forgets() {
        let mut tracker = ClientCacheTracker::new(both());
        tracker.note_sent(key(1), Rect::new(0, 0, 8, 8));
        tracker.note_sent(key(2), Rect::new(8, 0, 8, 8));

        let msg = ClientCacheMessage::PersistentCacheEviction(PersistentCacheEviction {
            keys: vec![key(1)],
        });
        let action = tracker.handle_message(&msg);
        assert_eq!(action, TrackerAction::default());
        assert!(!tracker.knows(&key(1)));
        assert!(tracker.knows(&key(2)));
        assert_eq!(tracker.last_rect(&key(1)), None);
    }

    #[test]
    fn test_content_eviction_forgets_by_id() {
        let mut tracker = ClientCacheTracker::new(both());
        tracker.note_sent(key(3), Rect::new(0, 0, 8, 8));

        let msg = ClientCacheMessage::CacheEviction(CacheEviction {
            content_ids: vec![key(3).content_id()],
        });
        tracker.handle_message(&msg);
        assert!(!tracker.knows(&key(3)));
    }

    #[test]
    fn test_hash_report_enables_references() {
        let mut tracker = ClientCacheTracker::new(both());
        let msg = ClientCacheMessage::HashReport(PersistentCacheHashReport {
            canonical: key(5),
            actual: key(6),
        });
        tracker.handle_message(&msg);
        // A later occurrence of the canonical content can be referenced.
        assert!(tracker.knows(&key(5)));
        assert!(!tracker.knows(&key(6)));
    }

    #[test]
    fn test_query_produces_resend() {
        let mut tracker = ClientCacheTracker::new(both());
        let msg = ClientCacheMessage::PersistentCacheQuery(PersistentCacheQuery {
            keys: vec![key(1), key(2)],
        });
        let action = tracker.handle_message(&msg);
        assert_eq!(action.resend, vec![key(1), key(2)]);

        let msg = ClientCacheMessage::RequestCachedData(RequestCachedData { content_id: 42 });
        let action = tracker.handle_message(&msg);
        assert_eq!(action.resend_ids, vec![42]);
    }

    #[test]
    fn test_hash_list_reassembly_out_of_order() {
        let mut tracker = ClientCacheTracker::new(both());
        let ids: Vec<u64> = (1..=5).collect();
        let mut chunks = PersistentHashList::chunked(9, &ids);
        // Force multiple chunks for the test.
        assert_eq!(chunks.len(), 1);
        chunks = vec![
            PersistentHashList {
                sequence_id: 9,
                total_chunks: 2,
                chunk_index: 1,
                content_ids: vec![4, 5],
            },
            PersistentHashList {
                sequence_id: 9,
                total_chunks: 2,
                chunk_index: 0,
                content_ids: vec![1, 2, 3],
            },
        ];

        // First (out-of-order) chunk alone is not enough.
        tracker.handle_message(&ClientCacheMessage::PersistentHashList(chunks[0].clone()));
        assert!(!tracker.knows(&CacheKey::from_content_id(1)));

        tracker.handle_message(&ClientCacheMessage::PersistentHashList(chunks[1].clone()));
        for id in 1..=5u64 {
            assert!(tracker.knows(&CacheKey::from_content_id(id)));
        }
    }

    #[test]
    fn test_hash_list_sequence_supersede() {
        let mut tracker = ClientCacheTracker::new(both());
        let stale = PersistentHashList {
            sequence_id: 1,
            total_chunks: 2,
            chunk_index: 0,
            content_ids: vec![1],
        };
        tracker.handle_message(&ClientCacheMessage::PersistentHashList(stale));

        // A new sequence id abandons the incomplete one.
        let fresh = PersistentHashList {
            sequence_id: 2,
            total_chunks: 1,
            chunk_index: 0,
            content_ids: vec![7],
        };
        tracker.handle_message(&ClientCacheMessage::PersistentHashList(fresh));
        assert!(tracker.knows(&CacheKey::from_content_id(7)));
        assert!(!tracker.knows(&CacheKey::from_content_id(1)));
    }

    #[test]
    fn test_update_counter() {
        let mut tracker = ClientCacheTracker::new(both());
        assert_eq!(tracker.note_update_sent(), 1);
        assert_eq!(tracker.note_update_sent(), 2);
    }
}
