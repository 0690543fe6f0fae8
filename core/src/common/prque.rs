//! Max-priority queue with removal by identity.
//!
//! Binary heap over a `Vec`, plus an index map from item to heap slot so that
//! `remove` and re-prioritising push are O(log n).

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct Prque<T> {
    heap: Vec<(T, i64)>,
    index: HashMap<T, usize>,
}

impl<T: Eq + Hash + Clone> Default for Prque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> Prque<T> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Pushes a value. Pushing a value already queued updates its priority.
    pub fn push(&mut self, value: T, priority: i64) {
        if let Some(&pos) = self.index.get(&value) {
            let old = self.heap[pos].1;
            self.heap[pos].1 = priority;
            if priority > old {
                self.sift_up(pos);
            } else {
                self.sift_down(pos);
            }
            return;
        }
        let pos = self.heap.len();
        self.index.insert(value.clone(), pos);
        self.heap.push((value, priority));
        self.sift_up(pos);
    }

    pub fn peek(&self) -> Option<(&T, i64)> {
        self.heap.first().map(|(v, p)| (v, *p))
    }

    pub fn pop(&mut self) -> Option<(T, i64)> {
        if self.heap.is_empty() {
            return None;
        }
        self.take(0)
    }

    /// Removes an arbitrary value, returning its priority.
    pub fn remove(&mut self, value: &T) -> Option<i64> {
        let pos = *self.index.get(value)?;
        self.take(pos).map(|(_, p)| p)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.index.contains_key(value)
    }

    pub fn priority_of(&self, value: &T) -> Option<i64> {
        self.index.get(value).map(|&pos| self.heap[pos].1)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Entries in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (&T, i64)> {
        self.heap.iter().map(|(v, p)| (v, *p))
    }

    /// Lowest-priority entry. Linear scan.
    pub fn min(&self) -> Option<(&T, i64)> {
        self.heap
            .iter()
            .min_by_key(|(_, p)| *p)
            .map(|(v, p)| (v, *p))
    }

    fn take(&mut self, pos: usize) -> Option<(T, i64)> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(pos, last);
        let item = self.heap.pop()?;
        self.index.remove(&item.0);
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        Some(item)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].0.clone(), a);
        self.index.insert(self.heap[b].0.clone(), b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].1 <= self.heap[parent].1 {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut largest = pos;
            if left < len && self.heap[left].1 > self.heap[largest].1 {
                largest = left;
            }
            if right < len && self.heap[right].1 > self.heap[largest].1 {
                largest = right;
            }
            if largest == pos {
                break;
            }
            self.swap(pos, largest);
            pos = largest;
        }
    }
}
