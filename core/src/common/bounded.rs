//! Fixed-capacity map with an explicit eviction order.
//!
//! Every peer-keyed or block-keyed cache in the node goes through this type.
//! The capacity is a hard bound: inserting into a full map always evicts
//! exactly one entry first, chosen by the map's [`EvictionOrder`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Which entry leaves a full map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOrder {
    /// Reads and writes refresh an entry; the entry untouched the longest goes first.
    LeastRecentlyUsed,
    /// Only insertion counts; the oldest inserted entry goes first.
    InsertionOrder,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    stamp: u64,
}

#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    order: EvictionOrder,
    entries: HashMap<K, Slot<V>>,
    // stamp -> key, oldest first
    recency: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Capacity zero is bumped to one so the map can always hold the latest entry.
    pub fn new(capacity: usize, order: EvictionOrder) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    pub fn lru(capacity: usize) -> Self {
        Self::new(capacity, EvictionOrder::LeastRecentlyUsed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> EvictionOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert or replace. Returns the evicted entry, if the insert pushed one out.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.next_stamp();
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            if self.order == EvictionOrder::LeastRecentlyUsed {
                self.recency.remove(&slot.stamp);
                slot.stamp = stamp;
                self.recency.insert(stamp, key);
            }
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        self.recency.insert(stamp, key.clone());
        self.entries.insert(key, Slot { value, stamp });
        evicted
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key).map(|slot| (key, slot.value))
    }

    /// Lookup that counts as a use under LRU ordering.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.order == EvictionOrder::LeastRecentlyUsed {
            let stamp = self.next_stamp();
            let slot = self.entries.get_mut(key)?;
            self.recency.remove(&slot.stamp);
            slot.stamp = stamp;
            self.recency.insert(stamp, key.clone());
            return Some(&slot.value);
        }
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Lookup that never changes eviction order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.stamp);
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Keys from the next entry to be evicted to the most recently used one.
    pub fn keys_by_age(&self) -> impl Iterator<Item = &K> {
        self.recency.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, slot)| (k, &slot.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_grows_past_capacity() {
        let mut map = BoundedMap::lru(3);
        for i in 0..10u32 {
            map.insert(i, i * 10);
            assert!(map.len() <= 3);
        }
        assert_eq!(map.len(), 3);
        let keys: Vec<_> = map.keys_by_age().copied().collect();
        assert_eq!(keys, vec![7, 8, 9]);
    }

    #[test]
    fn lru_get_protects_entry() {
        let mut map = BoundedMap::lru(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.get(&"a"), Some(&1));
        let evicted = map.insert("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(map.contains(&"a"));
        assert!(map.contains(&"c"));
    }

    #[test]
    fn insertion_order_ignores_reads() {
        let mut map = BoundedMap::new(2, EvictionOrder::InsertionOrder);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.get(&"a"), Some(&1));
        let evicted = map.insert("c", 3);
        assert_eq!(evicted, Some(("a", 1)));
    }

    #[test]
    fn replace_does_not_evict() {
        let mut map = BoundedMap::lru(2);
        map.insert(1, "x");
        map.insert(2, "y");
        assert!(map.insert(1, "z").is_none());
        assert_eq!(map.len(), 2);
        assert_eq!(map.peek(&1), Some(&"z"));
    }

    #[test]
    fn remove_and_clear() {
        let mut map = BoundedMap::lru(4);
        map.insert(1, 1);
        map.insert(2, 2);
        assert_eq!(map.remove(&1), Some(1));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.keys_by_age().count(), 1);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.keys_by_age().count(), 0);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut map = BoundedMap::lru(0);
        map.insert(1, 1);
        map.insert(2, 2);
        assert_eq!(map.capacity(), 1);
        assert!(map.contains(&2));
    }
}
