//! Bounded caches used by the message router.
//!
//! [`RecentSet`] rejects transactions we have already seen; [`ResponseCache`]
//! keeps recently served block messages so repeated `GetData` requests do not
//! hit the ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Transactions remembered for duplicate rejection.
pub const MAX_TX_CACHE_SIZE: usize = 100_000;

/// Block responses kept for repeated requests.
pub const MAX_RESP_CACHE_SIZE: usize = 50;

/// Insertion-ordered set that forgets its oldest entry when full.
pub struct RecentSet<K> {
    capacity: usize,
    keys: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Copy> RecentSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key);
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Least-recently-used map with a fixed capacity.
pub struct ResponseCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    usage: VecDeque<K>,
}

impl<K: Eq + Hash + Copy, V: Clone> ResponseCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            usage: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key)?.clone();
        self.promote(key);
        Some(value)
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.entries.insert(key, value).is_some() {
            self.promote(&key);
            return;
        }
        self.usage.push_back(key);
        while self.entries.len() > self.capacity {
            match self.usage.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn promote(&mut self, key: &K) {
        if let Some(pos) = self.usage.iter().position(|k| k == key) {
            self.usage.remove(pos);
        }
        self.usage.push_back(*key);
    }
}
