//! Concurrent arena-backed skiplist, the mutable memtable of the engine.
//!
//! Adapted from the RocksDB-style inline-skiplist design: every node, key
//! and value lives inside a single [`Arena`] and is addressed by `u32`
//! offsets. Towers are truncated to each node's real height, and all shared
//! state is mediated by single-word atomics:
//!
//! - `value` (u64): packed value offset/size, swung atomically on overwrite
//! - `tower[i]` (u32): forward links, updated with compare-and-swap
//! - list `height` (u32): raised with a CAS retry loop
//!
//! There are no locks. Any number of readers and writers may operate
//! concurrently; CAS failures re-resolve their splice and retry. Arena
//! growth is disabled in this path, so the arena must be pre-sized.
//!
//! Keys carry an 8-byte big-endian version tag (see [`crate::key`]);
//! ordering is ascending on the prefix and descending on the version, so
//! the newest write of a key is encountered first.

pub mod arena;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::entry::{Entry, ValueStruct};
use crate::key::{compare_keys, parse_ts, same_key};

pub use arena::Arena;

/// Maximum tower height.
pub(crate) const MAX_HEIGHT: usize = 20;

/// Probability gate for growing a tower one more level: p ~ 1/3.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

/// Fixed prefix of every node. The tower (`height` u32 links) follows
/// immediately after and is truncated to the real height.
#[repr(C)]
pub(crate) struct Node {
    /// Value offset (low 32 bits) and size (high 32 bits) packed into one
    /// word so readers can load both atomically.
    value: AtomicU64,

    key_offset: u32,
    key_size: u16,

    /// Height of the tower.
    height: u16,
}

pub(crate) const NODE_SIZE: usize = std::mem::size_of::<Node>();

fn encode_value(val_offset: u32, val_size: u32) -> u64 {
    u64::from(val_size) << 32 | u64::from(val_offset)
}

fn decode_value(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

impl Node {
    fn key<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.get_key(self.key_offset, self.key_size)
    }

    fn value_offset(&self) -> (u32, u32) {
        decode_value(self.value.load(Ordering::SeqCst))
    }

    fn set_value(&self, packed: u64) {
        self.value.store(packed, Ordering::SeqCst);
    }

    fn value_struct(&self, arena: &Arena) -> ValueStruct {
        let (offset, size) = self.value_offset();
        arena.get_val(offset, size)
    }
}

/// Allocates and initializes a node, its key and its value in the arena,
/// returning the node offset.
fn new_node(arena: &Arena, key: &[u8], v: &ValueStruct, height: usize) -> u32 {
    let node_offset = arena.put_node(height);
    let key_offset = arena.put_key(key);
    let packed = encode_value(arena.put_val(v), v.encoded_size());
    // The node is not linked into any tower yet, so plain initialization
    // cannot be observed by other threads.
    arena.init_node(node_offset, packed, key_offset, key.len() as u16, height as u16);
    node_offset
}

/// A concurrent ordered map over version-tagged keys.
pub struct Skiplist {
    /// Current height, `1..=MAX_HEIGHT`. Raised via CAS.
    height: AtomicU32,
    /// Offset of the head sentinel; it stores no key or value.
    head_offset: u32,
    arena: Arc<Arena>,
}

impl Skiplist {
    /// Creates an empty skiplist over a fixed arena of `arena_size` bytes.
    pub fn new(arena_size: usize) -> Self {
        let arena = Arc::new(Arena::new(arena_size));
        let head_offset = new_node(&arena, b"", &ValueStruct::default(), MAX_HEIGHT);
        Self {
            height: AtomicU32::new(1),
            head_offset,
            arena,
        }
    }

    fn height(&self) -> usize {
        self.height.load(Ordering::SeqCst) as usize
    }

    fn head(&self) -> &Node {
        self.arena.node_at(self.head_offset)
    }

    fn next(&self, node: &Node, level: usize) -> Option<&Node> {
        // A node is only reachable on levels below its own height.
        debug_assert!(level < node.height as usize);
        let offset = self
            .arena
            .tower(self.arena.node_offset(node), level)
            .load(Ordering::SeqCst);
        self.arena.node(offset)
    }

    fn random_height(&self) -> usize {
        let mut h = 1;
        while h < MAX_HEIGHT && rand::random::<u32>() <= HEIGHT_INCREASE {
            h += 1;
        }
        h
    }

    /// Finds the node nearest to `key`.
    ///
    /// With `less`, the rightmost node before `key`; otherwise the leftmost
    /// node after it. `allow_equal` permits returning an exact match. The
    /// bool is true iff the returned node's key equals `key`. Never returns
    /// the head sentinel.
    fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> (Option<&Node>, bool) {
        let mut x = self.head();
        let mut level = self.height() - 1;
        loop {
            // Invariant: x.key < key.
            let Some(next) = self.next(x, level) else {
                // x.key < key < end of list on this level.
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less {
                    return (None, false);
                }
                if self.arena.node_offset(x) == self.head_offset {
                    return (None, false);
                }
                return (Some(x), false);
            };

            let next_key = next.key(&self.arena);
            match compare_keys(key, next_key) {
                CmpOrdering::Greater => {
                    // x.key < next.key < key: keep moving right.
                    x = next;
                }
                CmpOrdering::Equal => {
                    if allow_equal {
                        return (Some(next), true);
                    }
                    if !less {
                        // Want strictly greater: grab the level-0 successor.
                        return (self.next(next, 0), false);
                    }
                    // Want strictly less: a lower level may hold something
                    // closer than x.
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if self.arena.node_offset(x) == self.head_offset {
                        return (None, false);
                    }
                    return (Some(x), false);
                }
                CmpOrdering::Less => {
                    // x.key < key < next.key.
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return (Some(next), false);
                    }
                    if self.arena.node_offset(x) == self.head_offset {
                        return (None, false);
                    }
                    return (Some(x), false);
                }
            }
        }
    }

    /// Brackets `key` on `level`, scanning right from `before`. Returns
    /// equal offsets when a node with this exact key exists on the level.
    fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
        loop {
            let next = self.arena.tower(before, level).load(Ordering::SeqCst);
            let Some(next_node) = self.arena.node(next) else {
                return (before, next);
            };
            match compare_keys(key, next_node.key(&self.arena)) {
                CmpOrdering::Equal => return (next, next),
                CmpOrdering::Less => return (before, next),
                CmpOrdering::Greater => before = next,
            }
        }
    }

    /// Swings an existing node's value word to a freshly allocated encoding
    /// of `v`. The old value bytes are simply orphaned in the arena.
    fn set_node_value(&self, node_offset: u32, v: &ValueStruct) {
        let vo = self.arena.put_val(v);
        let packed = encode_value(vo, v.encoded_size());
        self.arena.node_at(node_offset).set_value(packed);
    }

    /// Inserts the entry, overwriting the value if the key (including its
    /// version tag) is already present.
    pub fn add(&self, e: &Entry) {
        // Overwrites may not need a new node or a height bump, so both are
        // deferred until the splice proves the key absent.
        let key = &e.key;
        let v = ValueStruct::from(e);

        let list_height = self.height();
        let mut prev = [0u32; MAX_HEIGHT + 1];
        let mut next = [0u32; MAX_HEIGHT + 1];
        prev[list_height] = self.head_offset;
        for i in (0..list_height).rev() {
            // Use the splice of the level above to seed this level's scan.
            let (p, n) = self.find_splice_for_level(key, prev[i + 1], i);
            prev[i] = p;
            next[i] = n;
            if p == n {
                self.set_node_value(p, &v);
                return;
            }
        }

        let height = self.random_height();
        let x_offset = new_node(&self.arena, key, &v, height);

        // Try to raise the list height via CAS; another writer may win, in
        // which case the observed height is already tall enough.
        let mut list_height = self.height();
        while height > list_height {
            match self.height.compare_exchange(
                list_height as u32,
                height as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(_) => list_height = self.height(),
            }
        }

        // Link bottom-up. Once the node is in the base level, concurrent
        // writers of the same key will discover it there.
        for i in 0..height {
            loop {
                if self.arena.node(prev[i]).is_none() {
                    // Height exceeded the old list height, so no splice was
                    // computed for this level. These levels are sparse;
                    // resolve from the head.
                    assert!(i > 1, "unset splice below the old list height");
                    let (p, n) = self.find_splice_for_level(key, self.head_offset, i);
                    prev[i] = p;
                    next[i] = n;
                    // A racing insert of the same key can only be discovered
                    // on the base level.
                    assert_ne!(p, n, "duplicate key above the base level");
                }
                self.arena.tower(x_offset, i).store(next[i], Ordering::SeqCst);
                if self
                    .arena
                    .tower(prev[i], i)
                    .compare_exchange(next[i], x_offset, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
                // CAS failed: somebody linked between prev and next.
                // Re-resolve on this level only.
                let (p, n) = self.find_splice_for_level(key, prev[i], i);
                prev[i] = p;
                next[i] = n;
                if p == n {
                    assert_eq!(i, 0, "equality can only happen on the base level");
                    self.set_node_value(p, &v);
                    return;
                }
            }
        }
    }

    /// Looks up `key`, returning its value if a node with the same key
    /// prefix exists. The returned value carries the node's version tag.
    pub fn search(&self, key: &[u8]) -> Option<ValueStruct> {
        let (node, _) = self.find_near(key, false, true);
        let node = node?;
        let found_key = node.key(&self.arena);
        if !same_key(key, found_key) {
            return None;
        }
        let mut vs = node.value_struct(&self.arena);
        vs.version = parse_ts(found_key);
        Some(vs)
    }

    /// The last element, or None for an empty list. Descends from the top
    /// level, so this is logarithmic rather than a level-0 walk.
    fn find_last(&self) -> Option<&Node> {
        let mut node = self.head();
        let mut level = self.height() - 1;
        loop {
            if let Some(next) = self.next(node, level) {
                node = next;
                continue;
            }
            if level == 0 {
                if self.arena.node_offset(node) == self.head_offset {
                    return None;
                }
                return Some(node);
            }
            level -= 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.find_last().is_none()
    }

    /// Memory used within the internal arena.
    pub fn mem_size(&self) -> i64 {
        self.arena.len() as i64
    }

    pub fn iter(&self) -> SkiplistIterator<'_> {
        SkiplistIterator {
            list: self,
            node: 0,
        }
    }
}

/// A cursor over the skiplist. Starts invalid; call `rewind` or one of the
/// seek methods first.
pub struct SkiplistIterator<'a> {
    list: &'a Skiplist,
    /// Offset of the current node; 0 when exhausted or unpositioned.
    node: u32,
}

impl<'a> SkiplistIterator<'a> {
    pub fn valid(&self) -> bool {
        self.node != 0
    }

    pub fn rewind(&mut self) {
        self.seek_to_first();
    }

    pub fn key(&self) -> &'a [u8] {
        self.list.arena.node_at(self.node).key(&self.list.arena)
    }

    pub fn value(&self) -> ValueStruct {
        let node = self.list.arena.node_at(self.node);
        let mut vs = node.value_struct(&self.list.arena);
        vs.version = parse_ts(node.key(&self.list.arena));
        vs
    }

    /// The current position materialized as an entry.
    pub fn item(&self) -> Entry {
        let vs = self.value();
        Entry {
            key: self.key().to_vec(),
            value: vs.value,
            expires_at: vs.expires_at,
            meta: vs.meta,
            version: vs.version,
        }
    }

    pub fn next(&mut self) {
        assert!(self.valid());
        let node = self.list.arena.node_at(self.node);
        self.node = match self.list.next(node, 0) {
            Some(n) => self.list.arena.node_offset(n),
            None => 0,
        };
    }

    pub fn prev(&mut self) {
        assert!(self.valid());
        let (node, _) = self.list.find_near(self.key(), true, false);
        self.node = node.map_or(0, |n| self.list.arena.node_offset(n));
    }

    /// Positions at the first entry with key >= target.
    pub fn seek(&mut self, target: &[u8]) {
        let (node, _) = self.list.find_near(target, false, true);
        self.node = node.map_or(0, |n| self.list.arena.node_offset(n));
    }

    /// Positions at the last entry with key <= target.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        let (node, _) = self.list.find_near(target, true, true);
        self.node = node.map_or(0, |n| self.list.arena.node_offset(n));
    }

    pub fn seek_to_first(&mut self) {
        self.node = self
            .list
            .next(self.list.head(), 0)
            .map_or(0, |n| self.list.arena.node_offset(n));
    }

    pub fn seek_to_last(&mut self) {
        self.node = self
            .list
            .find_last()
            .map_or(0, |n| self.list.arena.node_offset(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key_with_ts;

    const ARENA_SIZE: usize = 1 << 20;

    fn value_of(list: &Skiplist, key: &[u8]) -> Option<Vec<u8>> {
        list.search(key).map(|vs| vs.value)
    }

    #[test]
    fn test_basic_crud() {
        let list = Skiplist::new(ARENA_SIZE);
        assert!(list.is_empty());

        list.add(&Entry::new("Key1", "Val1"));
        list.add(&Entry::new("Key2", "Val2"));

        assert_eq!(value_of(&list, b"Key1").unwrap(), b"Val1");
        assert_eq!(value_of(&list, b"Key2").unwrap(), b"Val2");
        assert!(value_of(&list, b"noexist").is_none());

        // Updating an existing key swings the value in place.
        list.add(&Entry::new("Key1", "Val1+1"));
        assert_eq!(value_of(&list, b"Key1").unwrap(), b"Val1+1");
        assert!(!list.is_empty());
    }

    #[test]
    fn test_random_insertion_order() {
        let list = Skiplist::new(ARENA_SIZE);
        let keys: Vec<String> = (0..100).map(|i| format!("{:05}", (i * 37) % 100)).collect();
        for key in &keys {
            list.add(&Entry::new(key.as_bytes(), key.as_bytes()));
        }
        for key in &keys {
            assert_eq!(value_of(&list, key.as_bytes()).unwrap(), key.as_bytes());
        }

        // An iterator from the head yields keys in ascending order.
        let mut iter = list.iter();
        iter.rewind();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_versions_newest_first() {
        let list = Skiplist::new(ARENA_SIZE);
        for version in [3u64, 1, 2] {
            let mut e = Entry::new(key_with_ts("acct", version), format!("v{version}"));
            e.version = version;
            list.add(&e);
        }

        // Searching at the highest version finds the newest entry first.
        let vs = list.search(&key_with_ts("acct", u64::MAX)).unwrap();
        assert_eq!(vs.value, b"v3");
        assert_eq!(vs.version, 3);

        // Iteration yields the same prefix newest-to-oldest.
        let mut iter = list.iter();
        iter.rewind();
        let mut versions = Vec::new();
        while iter.valid() {
            versions.push(iter.value().version);
            iter.next();
        }
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn test_overwrite_growth_is_bounded() {
        let list = Skiplist::new(ARENA_SIZE);
        let entry = Entry::new("k", "0123456789");
        list.add(&entry);

        let before = list.mem_size();
        list.add(&entry);
        let after = list.mem_size();

        // Only the new value encoding is allocated; the old one is orphaned.
        assert!(after - before <= 2 * i64::from(entry.encoded_size()));
        assert_eq!(value_of(&list, b"k").unwrap(), b"0123456789");
    }

    #[test]
    fn test_iterator_seek() {
        let list = Skiplist::new(ARENA_SIZE);
        for i in (1000..1100).step_by(10) {
            let key = format!("{i:05}");
            list.add(&Entry::new(key.as_bytes(), key.as_bytes()));
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.value().value, b"01000");

        iter.seek_to_last();
        assert_eq!(iter.value().value, b"01090");

        // Exact hit.
        iter.seek(b"01050");
        assert_eq!(iter.value().value, b"01050");

        // Between entries: lands on the next greater key.
        iter.seek(b"01055");
        assert_eq!(iter.value().value, b"01060");

        // Beyond the end.
        iter.seek(b"99999");
        assert!(!iter.valid());

        iter.seek_for_prev(b"01055");
        assert_eq!(iter.value().value, b"01050");

        iter.seek(b"01060");
        iter.prev();
        assert_eq!(iter.value().value, b"01050");
    }

    #[test]
    fn test_empty_list_iterator() {
        let list = Skiplist::new(ARENA_SIZE);
        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.rewind();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }

    #[test]
    fn test_concurrent_insert_and_read() {
        use std::thread;

        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        let list = Arc::new(Skiplist::new(32 << 20));

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("{:02}-{:05}", t, i);
                    list.add(&Entry::new(key.as_bytes(), key.as_bytes()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every key is searchable from any thread.
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("{:02}-{:05}", t, i);
                    let vs = list.search(key.as_bytes()).expect("missing key");
                    assert_eq!(vs.value, key.as_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // And iteration sees all of them in order.
        let mut iter = list.iter();
        iter.rewind();
        let mut count = 0;
        let mut last = Vec::new();
        while iter.valid() {
            let key = iter.key().to_vec();
            assert!(last < key);
            last = key;
            count += 1;
            iter.next();
        }
        assert_eq!(count, THREADS * PER_THREAD);
    }

    #[test]
    fn test_concurrent_same_key_overwrites() {
        use std::thread;

        let list = Arc::new(Skiplist::new(8 << 20));
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    list.add(&Entry::new("contended", format!("writer-{t}")));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one node survives; its value is whichever write landed
        // last.
        let vs = list.search(b"contended").unwrap();
        assert!(vs.value.starts_with(b"writer-"));
        let mut iter = list.iter();
        iter.rewind();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_mem_size_grows() {
        let list = Skiplist::new(ARENA_SIZE);
        let initial = list.mem_size();
        for i in 0..50 {
            list.add(&Entry::new(format!("key-{i}"), "value"));
        }
        assert!(list.mem_size() > initial);
    }
}
