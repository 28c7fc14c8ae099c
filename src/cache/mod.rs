//! Bounded, TTL-aware in-memory cache fronting the backing store.
//!
//! Size-bounded with LRU eviction and lazy TTL expiry. Keys are structured
//! (owner + namespace + field + chunk) and sorted, so invalidating everything
//! an entity owns is one range delete instead of string parsing. The cache
//! performs no IO and none of its operations can fail; accounting anomalies
//! degrade to more aggressive eviction, never to unbounded growth.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_CACHE_MAX_BYTES;
use crate::types::{BlobDigest, BulkItem, EntityId, EntityMetadata};

const NIL: usize = usize::MAX;

/// Namespace discriminant inside a [`CacheKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeySpace {
    Metadata,
    Chunk,
    Blob,
    Index,
}

/// Structured cache key, ordered owner-first so every key belonging to one
/// entity (metadata and all chunks) is contiguous in the sorted map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub owner: String,
    pub space: KeySpace,
    pub field: String,
    pub chunk: u32,
}

impl CacheKey {
    #[must_use]
    pub fn metadata(id: EntityId) -> Self {
        Self {
            owner: id.to_string(),
            space: KeySpace::Metadata,
            field: String::new(),
            chunk: 0,
        }
    }

    #[must_use]
    pub fn chunk(id: EntityId, field: &str, chunk: u32) -> Self {
        Self {
            owner: id.to_string(),
            space: KeySpace::Chunk,
            field: field.to_string(),
            chunk,
        }
    }

    #[must_use]
    pub fn blob(digest: &BlobDigest) -> Self {
        Self {
            owner: digest.to_hex(),
            space: KeySpace::Blob,
            field: String::new(),
            chunk: 0,
        }
    }

    #[must_use]
    pub fn index(name: &str) -> Self {
        Self {
            owner: name.to_string(),
            space: KeySpace::Index,
            field: String::new(),
            chunk: 0,
        }
    }
}

/// Values shared through the engine-wide cache instance.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Metadata(Arc<EntityMetadata>),
    Chunk(Arc<Vec<BulkItem>>),
    Blob(Arc<Vec<u8>>),
}

/// Counters exposed for the diagnostics surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub resident_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

struct Slot<V> {
    key: CacheKey,
    value: V,
    weight: usize,
    inserted_at: Instant,
    ttl: Option<Duration>,
    prev: usize,
    next: usize,
}

struct CacheInner<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    map: BTreeMap<CacheKey, usize>,
    head: usize,
    tail: usize,
    resident: usize,
    max_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

/// Generic bounded cache; the engine shares one `BoundedCache<CachedValue>`
/// across all components.
pub struct BoundedCache<V> {
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> Default for BoundedCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_BYTES)
    }
}

impl<V: Clone> BoundedCache<V> {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                slots: Vec::new(),
                free: Vec::new(),
                map: BTreeMap::new(),
                head: NIL,
                tail: NIL,
                resident: 0,
                max_bytes,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                invalidations: 0,
            }),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut inner = self.lock();
        let idx = match inner.map.get(key) {
            Some(idx) => *idx,
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if inner.is_expired(idx) {
            inner.remove_index(idx);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }
        inner.touch(idx);
        inner.hits += 1;
        inner.slots[idx].as_ref().map(|slot| slot.value.clone())
    }

    /// Insert or replace. `weight` is the entry's resident size in bytes;
    /// the caller supplies it because it already holds the encoded record.
    pub fn set(&self, key: CacheKey, value: V, weight: usize, ttl: Option<Duration>) {
        let mut inner = self.lock();
        if let Some(idx) = inner.map.get(&key).copied() {
            inner.remove_index(idx);
        }
        if weight > inner.max_bytes {
            // An entry that alone busts the budget is never resident.
            inner.evictions += 1;
            return;
        }
        inner.insert(key, value, weight, ttl);
        inner.evict_to_capacity();
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        match inner.map.get(key).copied() {
            Some(idx) if inner.is_expired(idx) => {
                inner.remove_index(idx);
                inner.expirations += 1;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.remove_index(idx);
                inner.invalidations += 1;
                true
            }
            None => false,
        }
    }

    /// Drop every entry whose key belongs to `owner` (an entity id or blob
    /// digest). One sorted-range sweep, no key-string parsing.
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut inner = self.lock();
        let indices: Vec<usize> = inner
            .map
            .range(
                CacheKey {
                    owner: owner.to_string(),
                    space: KeySpace::Metadata,
                    field: String::new(),
                    chunk: 0,
                }..,
            )
            .take_while(|(key, _)| key.owner == owner)
            .map(|(_, idx)| *idx)
            .collect();
        let removed = indices.len();
        for idx in indices {
            inner.remove_index(idx);
        }
        inner.invalidations += removed as u64;
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let removed = inner.map.len() as u64;
        inner.slots.clear();
        inner.free.clear();
        inner.map.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.resident = 0;
        inner.invalidations += removed;
    }

    /// Adjust the byte budget, evicting immediately if it shrank.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut inner = self.lock();
        inner.max_bytes = max_bytes;
        inner.evict_to_capacity();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.map.len(),
            resident_bytes: inner.resident,
            max_bytes: inner.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            invalidations: inner.invalidations,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the structure is still consistent enough to serve or evict.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> CacheInner<V> {
    fn is_expired(&self, idx: usize) -> bool {
        self.slots[idx]
            .as_ref()
            .is_some_and(|slot| match slot.ttl {
                Some(ttl) => slot.inserted_at.elapsed() > ttl,
                None => false,
            })
    }

    fn insert(&mut self, key: CacheKey, value: V, weight: usize, ttl: Option<Duration>) {
        let slot = Slot {
            key: key.clone(),
            value,
            weight,
            inserted_at: Instant::now(),
            ttl,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.resident = self.resident.saturating_add(weight);
        self.push_front(idx);
    }

    fn remove_index(&mut self, idx: usize) {
        self.detach(idx);
        if let Some(slot) = self.slots[idx].take() {
            self.map.remove(&slot.key);
            self.resident = self.resident.saturating_sub(slot.weight);
            self.free.push(idx);
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.resident > self.max_bytes {
            let tail = self.tail;
            if tail == NIL {
                // Accounting drifted with nothing left to evict; reset rather
                // than report a phantom resident size.
                self.resident = 0;
                break;
            }
            self.remove_index(tail);
            self.evictions += 1;
        }
    }

    fn touch(&mut self, idx: usize) {
        self.detach(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            if let Some(head_slot) = self.slots[old_head].as_mut() {
                head_slot.prev = idx;
            }
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        if prev != NIL {
            if let Some(slot) = self.slots[prev].as_mut() {
                slot.next = next;
            }
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            if let Some(slot) = self.slots[next].as_mut() {
                slot.prev = prev;
            }
        } else if self.tail == idx {
            self.tail = prev;
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = NIL;
        }
    }
}
