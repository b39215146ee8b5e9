//! Segmented LRU: the main cache behind the admission window.
//!
//! Two stages: entries admitted from the window land in *probation*; a hit
//! while on probation promotes into *protected*. When protected is full the
//! promotion swaps contents with the protected tail, demoting it back to
//! probation, so both nodes keep their identity in the hash index.

use std::collections::HashMap;

use super::list::{LinkedList, NodeSlab};
use super::{Stage, StoreItem};

pub(crate) struct SegmentedLru {
    pub(crate) probation_cap: usize,
    pub(crate) protected_cap: usize,
    pub(crate) probation: LinkedList,
    pub(crate) protected: LinkedList,
}

impl SegmentedLru {
    pub(crate) fn new(probation_cap: usize, protected_cap: usize) -> Self {
        Self {
            probation_cap,
            protected_cap,
            probation: LinkedList::new(),
            protected: LinkedList::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.probation.len() + self.protected.len()
    }

    /// Admits a window eviction into probation. Probation may overflow its
    /// nominal cap while the segmented total is under budget; once the
    /// total is at capacity the probation tail is evicted by swap.
    pub(crate) fn add<V>(
        &mut self,
        slab: &mut NodeSlab<V>,
        data: &mut HashMap<u64, usize>,
        mut item: StoreItem<V>,
    ) -> Option<StoreItem<V>> {
        item.stage = Stage::Probation;

        if self.probation.len() < self.probation_cap
            || self.len() < self.probation_cap + self.protected_cap
        {
            let key = item.key;
            let id = slab.alloc(item);
            data.insert(key, id);
            self.probation.push_front(slab, id);
            return None;
        }

        let tail = self.probation.back().expect("full probation has a tail");
        let key = item.key;
        let old = std::mem::replace(slab.item_mut(tail), item);
        data.remove(&old.key);
        data.insert(key, tail);
        self.probation.move_to_front(slab, tail);
        Some(old)
    }

    /// Adjusts recency for a hit on a resident node.
    pub(crate) fn get<V>(
        &mut self,
        slab: &mut NodeSlab<V>,
        data: &mut HashMap<u64, usize>,
        id: usize,
    ) {
        if slab.item(id).stage == Stage::Protected {
            self.protected.move_to_front(slab, id);
            return;
        }

        if self.protected.len() < self.protected_cap {
            // Room to promote outright.
            self.probation.unlink(slab, id);
            slab.item_mut(id).stage = Stage::Protected;
            self.protected.push_front(slab, id);
            return;
        }

        // Protected is full: swap contents with its tail. The hit item
        // takes the tail node and the demoted item takes the caller's
        // probation slot.
        let tail = self.protected.back().expect("full protected has a tail");
        {
            let (hit, demoted) = slab.two_items_mut(id, tail);
            hit.stage = Stage::Protected;
            demoted.stage = Stage::Probation;
            std::mem::swap(hit, demoted);
        }
        data.insert(slab.item(tail).key, tail);
        data.insert(slab.item(id).key, id);
        self.protected.move_to_front(slab, tail);
        self.probation.move_to_front(slab, id);
    }

    /// The node the next admission candidate must beat, or None while the
    /// segmented total is under budget.
    pub(crate) fn victim(&self) -> Option<usize> {
        if self.len() < self.probation_cap + self.protected_cap {
            return None;
        }
        self.probation.back()
    }

    /// Unlinks a node from its stage list and returns its contents. The
    /// caller has already dropped the hash-index entry.
    pub(crate) fn remove<V>(&mut self, slab: &mut NodeSlab<V>, id: usize) -> StoreItem<V> {
        match slab.item(id).stage {
            Stage::Protected => self.protected.unlink(slab, id),
            _ => self.probation.unlink(slab, id),
        }
        slab.release(id)
    }
}
