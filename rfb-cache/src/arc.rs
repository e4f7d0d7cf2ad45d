//! Byte-bounded Adaptive Replacement Cache.
//!
//! A generic `K -> V` map with ARC eviction:
//!
//! - T1/T2: resident lists (seen once recently vs. seen at least twice)
//! - B1/B2: ghost lists (evicted keys, no values)
//! - `p`: adaptive byte target for T1, nudged by ghost hits
//!
//! Entries are stored in an arena of slots addressed by stable `u32` ids;
//! the four lists are intrusive doubly-linked lists over those ids. The key
//! map, the list bookkeeping, and eviction reporting therefore never form
//! reference cycles, and all list operations are O(1).
//!
//! The cache is byte-bounded via a `size_of` hook supplied at construction:
//! `bytes(T1) + bytes(T2) <= capacity` holds after every operation. A
//! capacity of 0 means unbounded.
//!
//! Evicted `(key, value)` pairs are returned from the mutating call so the
//! owner can emit wire eviction notifications before the values drop. The
//! engine itself is concurrency-agnostic; the enclosing component
//! serialises access.

use crate::stats::ArcStats;
use std::collections::HashMap;
use std::hash::Hash;

const NIL: u32 = u32::MAX;

/// Which list a slot currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    T1 = 0,
    T2 = 1,
    B1 = 2,
    B2 = 3,
}

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    /// `Some` while resident (T1/T2), `None` for ghosts and free slots.
    value: Option<V>,
    /// Bytes charged while resident; 0 for ghosts.
    size: usize,
    list: ListId,
    prev: u32,
    next: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
    len: usize,
}

/// Generic byte-bounded ARC cache.
///
/// `K` is typically a [`rfb_common::CacheKey`]; `V` the cached payload.
pub struct ArcCache<K, V> {
    capacity: usize,
    /// Adaptive target size for T1, in bytes.
    p: usize,
    slots: Vec<Slot<K, V>>,
    free: Vec<u32>,
    map: HashMap<K, u32>,
    lists: [ListHead; 4],
    t1_bytes: usize,
    t2_bytes: usize,
    size_of: fn(&V) -> usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    inserts: u64,
    rejected: u64,
}

impl<K, V> ArcCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache with the given byte capacity (0 = unbounded) and
    /// entry-size hook.
    pub fn new(capacity: usize, size_of: fn(&V) -> usize) -> Self {
        Self {
            capacity,
            p: 0,
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            lists: [ListHead {
                head: NIL,
                tail: NIL,
                len: 0,
            }; 4],
            t1_bytes: 0,
            t2_bytes: 0,
            size_of,
            hits: 0,
            misses: 0,
            evictions: 0,
            inserts: 0,
            rejected: 0,
        }
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current resident size in bytes.
    pub fn resident_bytes(&self) -> usize {
        self.t1_bytes + self.t2_bytes
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.lists[ListId::T1 as usize].len + self.lists[ListId::T2 as usize].len
    }

    /// True when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a resident entry, promoting it per the ARC policy: a T1 hit
    /// moves the entry to the head of T2, a T2 hit refreshes its position.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let Some(&idx) = self.map.get(key) else {
            self.misses += 1;
            return None;
        };
        match self.slots[idx as usize].list {
            ListId::T1 => {
                let size = self.slots[idx as usize].size;
                self.unlink(idx);
                self.t1_bytes -= size;
                self.link_front(ListId::T2, idx);
                self.t2_bytes += size;
                self.hits += 1;
                self.slots[idx as usize].value.as_ref()
            }
            ListId::T2 => {
                self.unlink(idx);
                self.link_front(ListId::T2, idx);
                self.hits += 1;
                self.slots[idx as usize].value.as_ref()
            }
            // Ghost entries carry no value; adaptation happens on insert.
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Like [`get`](Self::get) but yields a mutable reference.
    ///
    /// The value's size is assumed unchanged; use
    /// [`insert`](Self::insert) to replace a value with one of a
    /// different size.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.get(key).is_none() {
            return None;
        }
        let idx = *self.map.get(key).unwrap();
        self.slots[idx as usize].value.as_mut()
    }

    /// Read a resident entry without touching recency state or statistics.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let &idx = self.map.get(key)?;
        self.slots[idx as usize].value.as_ref()
    }

    /// Mutate a resident entry in place without touching recency state or
    /// statistics. The value's byte size must not change.
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let &idx = self.map.get(key)?;
        self.slots[idx as usize].value.as_mut()
    }

    /// True if the key is resident (ghosts do not count).
    pub fn contains(&self, key: &K) -> bool {
        self.map
            .get(key)
            .is_some_and(|&idx| self.slots[idx as usize].value.is_some())
    }

    /// Insert or replace an entry.
    ///
    /// Returns the `(key, value)` pairs evicted to make room, in eviction
    /// order, so the caller can emit wire notifications before dropping
    /// them. An entry larger than the whole capacity is rejected (nothing
    /// is evicted for it) and counted in the statistics.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let size = (self.size_of)(&value);
        let mut evicted = Vec::new();

        if self.capacity > 0 && size > self.capacity {
            self.rejected += 1;
            tracing::debug!(size, capacity = self.capacity, "entry exceeds cache capacity");
            return evicted;
        }

        if let Some(&idx) = self.map.get(&key) {
            match self.slots[idx as usize].list {
                ListId::T1 | ListId::T2 => {
                    // Overwrite in place: detach so the slot cannot become
                    // its own eviction victim, make room, re-link at the
                    // head of T2 (an overwrite is a second access).
                    let old_size = self.slots[idx as usize].size;
                    match self.slots[idx as usize].list {
                        ListId::T1 => self.t1_bytes -= old_size,
                        _ => self.t2_bytes -= old_size,
                    }
                    self.unlink(idx);
                    self.make_room(size, false, &mut evicted);
                    let slot = &mut self.slots[idx as usize];
                    slot.value = Some(value);
                    slot.size = size;
                    self.link_front(ListId::T2, idx);
                    self.t2_bytes += size;
                }
                ListId::B1 => {
                    // Ghost hit in B1: recency is winning, grow p.
                    let b1 = self.lists[ListId::B1 as usize].len.max(1);
                    let b2 = self.lists[ListId::B2 as usize].len;
                    let delta = (b2 / b1).max(1) * size;
                    self.p = (self.p + delta).min(self.capacity);
                    self.discard_slot(idx);
                    self.make_room(size, false, &mut evicted);
                    self.admit(key, value, size, ListId::T2);
                }
                ListId::B2 => {
                    // Ghost hit in B2: frequency is winning, shrink p.
                    let b2 = self.lists[ListId::B2 as usize].len.max(1);
                    let b1 = self.lists[ListId::B1 as usize].len;
                    let delta = (b1 / b2).max(1) * size;
                    self.p = self.p.saturating_sub(delta);
                    self.discard_slot(idx);
                    self.make_room(size, true, &mut evicted);
                    self.admit(key, value, size, ListId::T2);
                }
            }
        } else {
            self.make_room(size, false, &mut evicted);
            self.admit(key, value, size, ListId::T1);
        }

        self.trim_ghosts();
        self.inserts += 1;
        evicted
    }

    /// Remove an entry (resident or ghost). Returns the value if it was
    /// resident. No eviction notification is produced for removals.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.get(key).copied()?;
        let resident = self.slots[idx as usize].value.is_some();
        if resident {
            let size = self.slots[idx as usize].size;
            match self.slots[idx as usize].list {
                ListId::T1 => self.t1_bytes -= size,
                ListId::T2 => self.t2_bytes -= size,
                _ => {}
            }
        }
        let value = self.slots[idx as usize].value.take();
        self.discard_slot(idx);
        value
    }

    /// Drop everything, including ghost history and the adaptive target.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.map.clear();
        self.lists = [ListHead {
            head: NIL,
            tail: NIL,
            len: 0,
        }; 4];
        self.t1_bytes = 0;
        self.t2_bytes = 0;
        self.p = 0;
    }

    /// Iterate over resident `(key, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value.as_ref().map(|v| (&slot.key, v)))
    }

    /// Snapshot of counters and gauges.
    pub fn stats(&self) -> ArcStats {
        ArcStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            inserts: self.inserts,
            rejected: self.rejected,
            t1_len: self.lists[ListId::T1 as usize].len,
            t2_len: self.lists[ListId::T2 as usize].len,
            b1_len: self.lists[ListId::B1 as usize].len,
            b2_len: self.lists[ListId::B2 as usize].len,
            t1_bytes: self.t1_bytes,
            t2_bytes: self.t2_bytes,
            p_bytes: self.p,
            capacity_bytes: self.capacity,
        }
    }

    /// Check the structural invariants: byte capacity respected, the four
    /// lists key-disjoint and consistent with the map, byte accounting
    /// exact. Intended for tests and debug assertions.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capacity > 0 && self.t1_bytes + self.t2_bytes > self.capacity {
            return Err(format!(
                "resident bytes {} exceed capacity {}",
                self.t1_bytes + self.t2_bytes,
                self.capacity
            ));
        }
        let mut seen = std::collections::HashSet::new();
        let mut bytes = [0usize; 4];
        let mut counted = [0usize; 4];
        for list in [ListId::T1, ListId::T2, ListId::B1, ListId::B2] {
            let mut idx = self.lists[list as usize].head;
            while idx != NIL {
                let slot = &self.slots[idx as usize];
                if slot.list != list {
                    return Err(format!("slot {idx} linked into wrong list"));
                }
                if !seen.insert(slot.key.clone()) {
                    return Err("key present in more than one list".into());
                }
                if matches!(list, ListId::T1 | ListId::T2) && slot.value.is_none() {
                    return Err(format!("resident slot {idx} has no value"));
                }
                if matches!(list, ListId::B1 | ListId::B2) && slot.value.is_some() {
                    return Err(format!("ghost slot {idx} still holds a value"));
                }
                bytes[list as usize] += slot.size;
                counted[list as usize] += 1;
                idx = slot.next;
            }
            if counted[list as usize] != self.lists[list as usize].len {
                return Err(format!(
                    "list {:?} length {} != recorded {}",
                    list, counted[list as usize], self.lists[list as usize].len
                ));
            }
        }
        if bytes[ListId::T1 as usize] != self.t1_bytes {
            return Err("T1 byte accounting drifted".into());
        }
        if bytes[ListId::T2 as usize] != self.t2_bytes {
            return Err("T2 byte accounting drifted".into());
        }
        if seen.len() != self.map.len() {
            return Err(format!(
                "map has {} keys but lists hold {}",
                self.map.len(),
                seen.len()
            ));
        }
        Ok(())
    }

    // -- internals ---------------------------------------------------------

    /// Evict from the tails of T1/T2 until `incoming` more bytes fit.
    ///
    /// Victim selection follows ARC: prefer T1 while its bytes exceed the
    /// target `p` (or exactly meet it when the incoming key was a B2
    /// ghost); otherwise take from T2. Evicted keys demote to the matching
    /// ghost list and the values are handed back to the caller.
    fn make_room(&mut self, incoming: usize, from_b2: bool, evicted: &mut Vec<(K, V)>) {
        if self.capacity == 0 {
            return;
        }
        while self.t1_bytes + self.t2_bytes + incoming > self.capacity {
            let t1_len = self.lists[ListId::T1 as usize].len;
            let t2_len = self.lists[ListId::T2 as usize].len;
            if t1_len == 0 && t2_len == 0 {
                break;
            }
            let from_t1 = t1_len > 0
                && (self.t1_bytes > self.p
                    || (from_b2 && self.t1_bytes == self.p)
                    || t2_len == 0);
            let (list, ghost) = if from_t1 {
                (ListId::T1, ListId::B1)
            } else {
                (ListId::T2, ListId::B2)
            };
            let idx = self.lists[list as usize].tail;
            debug_assert_ne!(idx, NIL);
            self.unlink(idx);
            let (key, value, size) = {
                let slot = &mut self.slots[idx as usize];
                let size = slot.size;
                let value = slot.value.take().expect("resident slot has a value");
                slot.size = 0;
                (slot.key.clone(), value, size)
            };
            match list {
                ListId::T1 => self.t1_bytes -= size,
                _ => self.t2_bytes -= size,
            }
            self.link_front(ghost, idx);
            self.evictions += 1;
            evicted.push((key, value));
        }
    }

    /// Allocate a slot for a fresh entry at the head of `list`.
    fn admit(&mut self, key: K, value: V, size: usize, list: ListId) {
        let idx = if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.key = key.clone();
            slot.value = Some(value);
            slot.size = size;
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                key: key.clone(),
                value: Some(value),
                size,
                list,
                prev: NIL,
                next: NIL,
            });
            idx
        };
        self.map.insert(key, idx);
        self.link_front(list, idx);
        match list {
            ListId::T1 => self.t1_bytes += size,
            ListId::T2 => self.t2_bytes += size,
            _ => unreachable!("fresh entries are always resident"),
        }
    }

    /// Unlink a slot and return it to the free pool (value already taken
    /// or absent).
    fn discard_slot(&mut self, idx: u32) {
        self.unlink(idx);
        let slot = &mut self.slots[idx as usize];
        slot.value = None;
        slot.size = 0;
        self.map.remove(&slot.key);
        self.free.push(idx);
    }

    /// Bound the ghost lists so metadata stays proportional to the
    /// resident set.
    fn trim_ghosts(&mut self) {
        let bound = (2 * self.len()).max(16);
        for ghost in [ListId::B1, ListId::B2] {
            while self.lists[ghost as usize].len > bound {
                let idx = self.lists[ghost as usize].tail;
                self.discard_slot(idx);
            }
        }
    }

    fn link_front(&mut self, list: ListId, idx: u32) {
        let head = self.lists[list as usize].head;
        {
            let slot = &mut self.slots[idx as usize];
            slot.list = list;
            slot.prev = NIL;
            slot.next = head;
        }
        if head != NIL {
            self.slots[head as usize].prev = idx;
        }
        let entry = &mut self.lists[list as usize];
        entry.head = idx;
        if entry.tail == NIL {
            entry.tail = idx;
        }
        entry.len += 1;
    }

    fn unlink(&mut self, idx: u32) {
        let (list, prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.list, slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.lists[list as usize].head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        } else {
            self.lists[list as usize].tail = prev;
        }
        self.lists[list as usize].len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.prev = NIL;
        slot.next = NIL;
    }
}
