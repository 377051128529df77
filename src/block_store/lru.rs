//! Fixed-capacity LRU cache used as the read-through layer in front of a
//! [`super::RawBackend`].

use std::collections::HashMap;
use std::hash::Hash;

/// Order is tracked as a plain `Vec` of keys, oldest first. Capacities used
/// in practice (the default is 1024) make the O(n) reorder on touch cheap
/// relative to the backend I/O it's shielding.
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: Vec<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: HashMap::new(), order: Vec::new() }
    }

    /// Number of live entries. Callers must use this (or `is_empty`)
    /// explicitly rather than relying on the cache's truthiness — an empty
    /// cache is a normal, expected state, not an error condition.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    /// Moves the entry to MRU on a hit.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key).cloned();
        if value.is_some() {
            self.touch(key);
        }
        value
    }

    /// Evicts the LRU entry when at capacity and the key is new.
    pub fn put(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.entries.len() == self.capacity {
            // Evict oldest. `is_empty()` guards against a zero-capacity
            // cache somehow reaching this branch with nothing to evict.
            if !self.order.is_empty() {
                let oldest = self.order.remove(0);
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key.clone(), value);
        self.order.push(key);
    }
}
