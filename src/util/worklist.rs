// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Priority worklist for the fixed-point solver.
//!
//! Entries carry the priority they were pushed with; higher priorities (more
//! recently stamped nodes) pop first. The same item may be queued several
//! times with different priorities, so callers are expected to drop stale pops
//! by comparing the returned priority against the item's current stamp.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    prio: u32,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prio.cmp(&other.prio)
    }
}

pub struct Worklist<T> {
    heap: BinaryHeap<Entry<T>>,
}

impl<T> Worklist<T> {
    pub fn new() -> Self {
        Worklist {
            heap: BinaryHeap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn push(&mut self, item: T, prio: u32) {
        self.heap.push(Entry { prio, item });
    }

    /// Pops the entry with the highest priority, returning the item together
    /// with the priority it was pushed at.
    pub fn pop(&mut self) -> Option<(T, u32)> {
        self.heap.pop().map(|e| (e.item, e.prio))
    }
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::Worklist;

    #[test]
    fn pops_highest_priority_first() {
        let mut wl = Worklist::new();
        wl.push("a", 1);
        wl.push("b", 5);
        wl.push("c", 3);
        assert_eq!(wl.pop(), Some(("b", 5)));
        assert_eq!(wl.pop(), Some(("c", 3)));
        assert_eq!(wl.pop(), Some(("a", 1)));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn duplicate_pushes_survive() {
        let mut wl = Worklist::new();
        wl.push(7u32, 0);
        wl.push(7u32, 2);
        assert_eq!(wl.pop(), Some((7, 2)));
        assert_eq!(wl.pop(), Some((7, 0)));
        assert!(wl.is_empty());
    }
}
