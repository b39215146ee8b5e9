//! Window LRU: the small admission queue in front of the main cache.

use std::collections::HashMap;

use super::list::{LinkedList, NodeSlab};
use super::StoreItem;

pub(crate) struct WindowLru {
    cap: usize,
    pub(crate) list: LinkedList,
}

impl WindowLru {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            list: LinkedList::new(),
        }
    }

    /// Inserts a fresh item. When the window is full the tail node is
    /// reused: its contents are swapped with the incoming item and the old
    /// contents become the eviction candidate. Same-key handling happens a
    /// layer up, in the cache surface.
    pub(crate) fn add<V>(
        &mut self,
        slab: &mut NodeSlab<V>,
        data: &mut HashMap<u64, usize>,
        item: StoreItem<V>,
    ) -> Option<StoreItem<V>> {
        if self.list.len() < self.cap {
            let key = item.key;
            let id = slab.alloc(item);
            data.insert(key, id);
            self.list.push_front(slab, id);
            return None;
        }

        let tail = self.list.back().expect("full window has a tail");
        let key = item.key;
        let old = std::mem::replace(slab.item_mut(tail), item);
        data.remove(&old.key);
        data.insert(key, tail);
        self.list.move_to_front(slab, tail);
        Some(old)
    }

    /// MRU-moves a resident node.
    pub(crate) fn get<V>(&mut self, slab: &mut NodeSlab<V>, id: usize) {
        self.list.move_to_front(slab, id);
    }

    /// Unlinks a node and returns its contents. The caller has already
    /// dropped the hash-index entry.
    pub(crate) fn remove<V>(&mut self, slab: &mut NodeSlab<V>, id: usize) -> StoreItem<V> {
        self.list.unlink(slab, id);
        slab.release(id)
    }
}
