//! Least-recently-used eviction.
//!
//! [`TouchOrder`] only tracks recency; the values live wherever the caller
//! keeps them and are torn down through the `on_evict` callback. Touches are
//! O(1): a re-touched key leaves a stale entry in the queue that is skipped
//! (and dropped) when it reaches the front.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct TouchOrder<K> {
    /// Oldest at the front. Entries whose generation no longer matches
    /// `live` are stale.
    queue: VecDeque<(K, u64)>,
    live: HashMap<K, u64>,
    next_gen: u64,
}

impl<K: Eq + Hash + Clone> TouchOrder<K> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            live: HashMap::new(),
            next_gen: 0,
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Move `key` to the most-recent end, inserting it if new.
    pub fn touch(&mut self, key: K) {
        let generation = self.next_gen;
        self.next_gen += 1;
        self.live.insert(key.clone(), generation);
        self.queue.push_back((key, generation));
        self.compact();
    }

    /// Forget `key` without calling any teardown.
    pub fn remove(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    /// Evict least-recent keys while more than `limit` remain.
    pub fn evict(&mut self, limit: usize, mut on_evict: impl FnMut(K)) {
        while self.live.len() > limit {
            let Some((key, generation)) = self.queue.pop_front() else {
                break;
            };
            if self.live.get(&key) == Some(&generation) {
                self.live.remove(&key);
                on_evict(key);
            }
        }
    }

    /// Least-recent key, if any.
    pub fn oldest(&mut self) -> Option<&K> {
        while let Some((key, generation)) = self.queue.front() {
            if self.live.get(key) == Some(generation) {
                break;
            }
            self.queue.pop_front();
        }
        self.queue.front().map(|(key, _)| key)
    }

    /// Rebuild the queue once stale entries dominate, keeping memory bounded
    /// under repeated touches of the same keys.
    fn compact(&mut self) {
        if self.queue.len() > 2 * self.live.len() + 16 {
            let live = &self.live;
            self.queue.retain(|(key, generation)| live.get(key) == Some(generation));
        }
    }
}

impl<K: Eq + Hash + Clone> Default for TouchOrder<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Map with a fixed capacity and LRU eviction.
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, V>,
    order: TouchOrder<K>,
    limit: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: TouchOrder::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.order.touch(key.clone());
        }
        self.entries.get(key)
    }

    /// Look up without affecting recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Insert and return whatever was evicted to stay within the limit.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.entries.insert(key.clone(), value);
        self.order.touch(key);
        let mut evicted = Vec::new();
        let entries = &mut self.entries;
        self.order.evict(self.limit, |old| {
            if let Some(v) = entries.remove(&old) {
                evicted.push((old, v));
            }
        });
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.remove(key);
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order = TouchOrder::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recent() {
        let mut order = TouchOrder::new();
        for key in ["a", "b", "c"] {
            order.touch(key);
        }
        let mut evicted = Vec::new();
        order.touch("d");
        order.evict(3, |k| evicted.push(k));
        assert_eq!(evicted, vec!["a"]);
        assert!(!order.contains(&"a"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_touch_prevents_eviction() {
        let mut order = TouchOrder::new();
        order.touch("a");
        order.touch("b");
        order.touch("c");
        order.touch("a");
        order.touch("d");
        let mut evicted = Vec::new();
        order.evict(3, |k| evicted.push(k));
        assert_eq!(evicted, vec!["b"]);
        assert!(order.contains(&"a"));
        assert_eq!(order.oldest(), Some(&"c"));
    }

    #[test]
    fn test_repeated_touches_stay_bounded() {
        let mut order = TouchOrder::new();
        for i in 0..10_000 {
            order.touch(i % 4);
        }
        assert_eq!(order.len(), 4);
        assert!(order.queue.len() <= 2 * 4 + 17);
        let mut evicted = Vec::new();
        order.evict(0, |k| evicted.push(k));
        assert_eq!(evicted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_bounded_cache() {
        let mut cache = BoundedCache::new(2);
        assert!(cache.insert("a", 1).is_empty());
        assert!(cache.insert("b", 2).is_empty());
        assert_eq!(cache.get(&"a"), Some(&1));
        let evicted = cache.insert("c", 3);
        assert_eq!(evicted, vec![("b", 2)]);
        assert_eq!(cache.peek(&"b"), None);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(cache.insert("d", 4).is_empty());
    }
}
