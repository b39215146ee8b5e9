//! TinyLFU block/value cache.
//!
//! A small admission window (1% of capacity) fronts a segmented LRU main
//! cache. When the window evicts a candidate it must beat the main cache's
//! probation tail to be admitted: first past a bloom-filter doorkeeper that
//! rejects keys never seen on the read path, then by Count-Min Sketch
//! frequency estimate. The sketch and doorkeeper age periodically so stale
//! popularity decays.
//!
//! Keys are reduced to a `(key_hash, conflict_hash)` pair up front. Integer
//! keys hash to themselves; byte-shaped keys use a process-local hash for
//! the index and xxhash64 to disambiguate collisions.

mod list;
mod lru;
mod s2lru;
mod sketch;

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use xxhash_rust::xxh64::xxh64;

use crate::bloom::Doorkeeper;

use list::NodeSlab;
use lru::WindowLru;
use s2lru::SegmentedLru;
use sketch::CmSketch;

/// Which list a cached item currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Window,
    Probation,
    Protected,
}

/// A cached entry as held by the LRU lists.
#[derive(Debug)]
pub(crate) struct StoreItem<V> {
    pub(crate) stage: Stage,
    pub(crate) key: u64,
    pub(crate) conflict: u64,
    pub(crate) value: V,
}

/// Types usable as cache keys.
///
/// Integers map to themselves with no conflict hash; byte-shaped keys get a
/// process-local index hash plus an xxhash64 conflict hash to disambiguate
/// index collisions.
pub trait CacheKey {
    fn hashes(&self, state: &RandomState) -> (u64, u64);
}

macro_rules! impl_cache_key_for_int {
    ($($t:ty),*) => {
        $(impl CacheKey for $t {
            fn hashes(&self, _state: &RandomState) -> (u64, u64) {
                (*self as u64, 0)
            }
        })*
    };
}

impl_cache_key_for_int!(u8, u32, u64, usize, i32, i64);

impl CacheKey for [u8] {
    fn hashes(&self, state: &RandomState) -> (u64, u64) {
        (state.hash_one(self), xxh64(self, 0))
    }
}

impl CacheKey for Vec<u8> {
    fn hashes(&self, state: &RandomState) -> (u64, u64) {
        self.as_slice().hashes(state)
    }
}

impl CacheKey for str {
    fn hashes(&self, state: &RandomState) -> (u64, u64) {
        (state.hash_one(self), xxh64(self.as_bytes(), 0))
    }
}

impl CacheKey for String {
    fn hashes(&self, state: &RandomState) -> (u64, u64) {
        self.as_str().hashes(state)
    }
}

/// Hit/miss counters.
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}

pub(crate) struct CacheInner<V> {
    slab: NodeSlab<V>,
    data: HashMap<u64, usize>,
    pub(crate) lru: WindowLru,
    pub(crate) slru: SegmentedLru,
    door: Doorkeeper,
    sketch: CmSketch,
    /// Accesses since the last aging pass.
    t: u64,
    pub(crate) threshold: u64,
    state: RandomState,
}

/// A TinyLFU cache over values of type `V`.
///
/// A single reader-writer lock guards the policy state. `get` upgrades to
/// the write lock because a hit moves its node to the front of its stage
/// and bumps the frequency sketch.
pub struct Cache<V> {
    inner: RwLock<CacheInner<V>>,
    stats: Stats,
}

impl<V> Cache<V> {
    /// A cache admitting roughly `size` entries.
    pub fn new(size: usize) -> Self {
        let window_cap = (size / 100).max(1);
        let slru_cap = (size * 99 / 100).max(1);
        let protected_cap = (slru_cap / 5).max(1);
        let probation_cap = (slru_cap - protected_cap).max(1);

        Self {
            inner: RwLock::new(CacheInner {
                slab: NodeSlab::with_capacity(size),
                data: HashMap::with_capacity(size),
                lru: WindowLru::new(window_cap),
                slru: SegmentedLru::new(probation_cap, protected_cap),
                door: Doorkeeper::new(size, 0.01),
                sketch: CmSketch::new(size.max(1) as u64),
                t: 0,
                // Age the frequency state every ~10 generations of the
                // cache's capacity.
                threshold: (size as u64) * 10,
                state: RandomState::new(),
            }),
            stats: Stats::new(),
        }
    }

    /// Inserts or overwrites. Returns whether some resident entry was
    /// evicted to make room.
    pub fn set<K: CacheKey + ?Sized>(&self, key: &K, value: V) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (key_hash, conflict) = key.hashes(&inner.state);
        inner.set(key_hash, conflict, value).is_some()
    }

    /// Looks up a key, counting the access for admission purposes.
    pub fn get<K: CacheKey + ?Sized>(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (key_hash, conflict) = key.hashes(&inner.state);
        match inner.get(key_hash, conflict) {
            Some(id) => {
                self.stats.hit();
                Some(inner.slab.item(id).value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Removes a key, returning its value.
    pub fn del<K: CacheKey + ?Sized>(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (key_hash, conflict) = key.hashes(&inner.state);
        inner.del(key_hash, conflict).map(|item| item.value)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .data
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime (hits, misses).
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner<V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> CacheInner<V> {
    /// Records an access to `key_hash` in the frequency sketch and primes
    /// the doorkeeper with it.
    fn touch(&mut self, key_hash: u64) {
        self.sketch.increment(key_hash);
        self.door.insert(key_hash as u32);
    }

    pub(crate) fn set(
        &mut self,
        key_hash: u64,
        conflict: u64,
        value: V,
    ) -> Option<StoreItem<V>> {
        if let Some(&id) = self.data.get(&key_hash) {
            let stage = {
                let item = self.slab.item_mut(id);
                if item.conflict == conflict {
                    // Overwrite in place; no recency adjustment.
                    item.value = value;
                    return None;
                }
                item.stage
            };
            // Same index hash, different key: drop the stale resident so
            // the index never points at an orphaned node.
            self.data.remove(&key_hash);
            match stage {
                Stage::Window => self.lru.remove(&mut self.slab, id),
                _ => self.slru.remove(&mut self.slab, id),
            };
        }

        let candidate = StoreItem {
            stage: Stage::Window,
            key: key_hash,
            conflict,
            value,
        };
        let candidate = self.lru.add(&mut self.slab, &mut self.data, candidate)?;

        // The window was full. The displaced item must earn its way into
        // the main cache.
        let Some(victim_id) = self.slru.victim() else {
            return self.slru.add(&mut self.slab, &mut self.data, candidate);
        };

        if !self.door.contains(candidate.key as u32) {
            // Never seen on the read path: a one-hit wonder.
            return Some(candidate);
        }

        let victim_count = self.sketch.estimate(self.slab.item(victim_id).key);
        let candidate_count = self.sketch.estimate(candidate.key);
        if candidate_count < victim_count {
            return Some(candidate);
        }
        self.slru.add(&mut self.slab, &mut self.data, candidate)
    }

    pub(crate) fn get(&mut self, key_hash: u64, conflict: u64) -> Option<usize> {
        self.t += 1;
        if self.t == self.threshold {
            tracing::debug!(accesses = self.t, "aging cache frequency state");
            self.sketch.reset();
            self.door.clear();
            self.t = 0;
        }

        let Some(&id) = self.data.get(&key_hash) else {
            self.touch(key_hash);
            return None;
        };

        let (item_conflict, item_key, stage) = {
            let item = self.slab.item(id);
            (item.conflict, item.key, item.stage)
        };
        if item_conflict != conflict {
            self.touch(key_hash);
            return None;
        }

        self.touch(item_key);
        match stage {
            Stage::Window => self.lru.get(&mut self.slab, id),
            _ => self.slru.get(&mut self.slab, &mut self.data, id),
        }
        Some(id)
    }

    pub(crate) fn del(&mut self, key_hash: u64, conflict: u64) -> Option<StoreItem<V>> {
        let &id = self.data.get(&key_hash)?;
        let item = self.slab.item(id);
        if conflict != 0 && conflict != item.conflict {
            return None;
        }
        let stage = item.stage;
        self.data.remove(&key_hash);
        let removed = match stage {
            Stage::Window => self.lru.remove(&mut self.slab, id),
            _ => self.slru.remove(&mut self.slab, id),
        };
        Some(removed)
    }

    #[cfg(test)]
    pub(crate) fn item_for(&self, key_hash: u64) -> Option<&StoreItem<V>> {
        self.data.get(&key_hash).map(|&id| self.slab.item(id))
    }

    #[cfg(test)]
    pub(crate) fn estimate(&self, key_hash: u64) -> u8 {
        self.sketch.estimate(key_hash)
    }

    #[cfg(test)]
    pub(crate) fn lens(&self) -> (usize, usize, usize) {
        (
            self.lru.list.len(),
            self.slru.protected.len(),
            self.slru.probation.len(),
        )
    }
}
