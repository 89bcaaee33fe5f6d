//! In-memory LRU tier.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde_json::Value;

pub(crate) struct MemoryTier {
    entries: LruCache<String, Value>,
}

impl MemoryTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    /// Insert, returning the key evicted to make room, if any.
    pub fn put(&mut self, key: String, value: Value) -> Option<String> {
        match self.entries.push(key.clone(), value) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    /// Presence check that leaves the recency order alone.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Change capacity, keeping the most recently used entries.
    pub fn resize(&mut self, capacity: NonZeroUsize) {
        self.entries.resize(capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
