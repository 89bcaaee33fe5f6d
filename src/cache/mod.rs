//! Two-tier cache for engine results.
//!
//! A bounded in-memory LRU tier sits in front of a durable tier (files by
//! default). Durable hits are promoted into memory. Durable entries expire
//! by age; a background sweeper removes them on a fixed interval.
//!
//! Cache failures never fail the caller: they count as errors, emit a
//! `cache_error` event, and degrade to a miss or no-op.

pub mod durable;
pub mod key;
mod memory;
pub mod stats;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::events::{CacheTier, CoreEvent, EventBus};

pub use durable::{DurableStore, FsStore, StoredEntry};
pub use key::cache_key;
pub use stats::CacheStats;

use memory::MemoryTier;
use stats::Counters;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub struct TieredCache {
    memory: Mutex<MemoryTier>,
    durable: Arc<dyn DurableStore>,
    max_age: Duration,
    enabled: AtomicBool,
    memory_enabled: AtomicBool,
    durable_enabled: AtomicBool,
    counters: Counters,
    /// Bumped by every write so a slow durable read cannot backfill a
    /// value that a concurrent put or remove has superseded.
    generation: AtomicU64,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TieredCache {
    /// File-backed cache under `config.dir`. Starts the expiry sweeper.
    pub fn new(config: CacheConfig, events: EventBus) -> Result<Arc<Self>, CacheError> {
        let store = Arc::new(FsStore::new(config.dir.clone()));
        Self::with_store(config, store, events)
    }

    /// Cache over any durable store. Must be called inside a tokio runtime.
    pub fn with_store(
        config: CacheConfig,
        durable: Arc<dyn DurableStore>,
        events: EventBus,
    ) -> Result<Arc<Self>, CacheError> {
        let capacity = NonZeroUsize::new(config.memory_capacity).ok_or(CacheError::ZeroCapacity)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache = Arc::new_cyclic(|weak| Self {
            memory: Mutex::new(MemoryTier::new(capacity)),
            durable,
            max_age: config.max_age,
            enabled: AtomicBool::new(config.enabled),
            memory_enabled: AtomicBool::new(config.memory_enabled),
            durable_enabled: AtomicBool::new(config.durable_enabled),
            counters: Counters::default(),
            generation: AtomicU64::new(0),
            events,
            shutdown_tx,
            sweeper: Mutex::new(Some(spawn_sweeper(
                weak.clone(),
                config.sweep_interval,
                shutdown_rx,
            ))),
        });

        info!(
            capacity = config.memory_capacity,
            max_age_secs = config.max_age.as_secs(),
            "Tiered cache initialized"
        );
        Ok(cache)
    }

    /// Deterministic key for `params` namespaced by `prefix`.
    pub fn key<T: Serialize + ?Sized>(prefix: &str, params: &T) -> Result<String, CacheError> {
        cache_key(prefix, params)
    }

    /// Look up `key`, memory first, then the durable tier.
    ///
    /// Durable hits are copied into memory unless a write to the cache
    /// happened while the durable read was in flight.
    /// See [`TieredCache::put`] for which keys reach the durable tier.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }

        let memory_enabled = self.memory_enabled.load(Ordering::Relaxed);
        if memory_enabled {
            if let Some(value) = self.memory.lock().await.get(key) {
                Counters::bump(&self.counters.memory_hits);
                self.events.publish(CoreEvent::CacheHit {
                    key: key.to_string(),
                    tier: CacheTier::Memory,
                });
                return Some(value);
            }
        }

        if self.durable_enabled.load(Ordering::Relaxed) {
            let generation = self.generation.load(Ordering::SeqCst);
            match self.durable.load(key).await {
                Ok(Some(entry)) if !self.is_expired(entry.modified) => {
                    Counters::bump(&self.counters.durable_hits);
                    if memory_enabled {
                        let mut memory = self.memory.lock().await;
                        if self.generation.load(Ordering::SeqCst) == generation
                            && !memory.contains(key)
                        {
                            memory.put(key.to_string(), entry.value.clone());
                        }
                    }
                    self.events.publish(CoreEvent::CacheHit {
                        key: key.to_string(),
                        tier: CacheTier::Durable,
                    });
                    return Some(entry.value);
                }
                Ok(Some(_)) => {
                    debug!(key, "Durable cache entry expired");
                    if let Err(e) = self.durable.delete(key).await {
                        self.record_error(Some(key), e);
                    }
                }
                Ok(None) => {}
                Err(e) => self.record_error(Some(key), e),
            }
        }

        Counters::bump(&self.counters.misses);
        self.events.publish(CoreEvent::CacheMiss {
            key: key.to_string(),
        });
        None
    }

    /// Write through to every enabled tier.
    ///
    /// Only keys built by [`TieredCache::key`] (or otherwise limited to
    /// `[A-Za-z0-9_-]`) reach the file-backed durable tier; other keys are
    /// kept in memory and count as a cache error.
    pub async fn put(&self, key: &str, value: Value) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        if self.durable_enabled.load(Ordering::Relaxed) {
            if let Err(e) = self.durable.store(key, &value).await {
                self.record_error(Some(key), e);
            }
        }

        if self.memory_enabled.load(Ordering::Relaxed) {
            if let Some(evicted) = self.memory.lock().await.put(key.to_string(), value) {
                debug!(key = %evicted, "Evicted least recently used entry");
            }
        }

        self.events.publish(CoreEvent::CacheStored {
            key: key.to_string(),
        });
    }

    /// Remove `key` from both tiers. Returns `true` if either held it.
    pub async fn remove(&self, key: &str) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let in_memory = self.memory.lock().await.remove(key);
        let on_disk = match self.durable.delete(key).await {
            Ok(found) => found,
            Err(e) => {
                self.record_error(Some(key), e);
                false
            }
        };

        let removed = in_memory || on_disk;
        if removed {
            self.events.publish(CoreEvent::CacheRemoved {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Clear the memory tier and durable entries at least `older_than_days`
    /// old (all of them when `None`). Returns the number of entries removed.
    pub async fn clear(&self, older_than_days: Option<u32>) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut count = 0;

        if self.memory_enabled.load(Ordering::Relaxed) {
            count += self.memory.lock().await.clear();
        }

        if self.durable_enabled.load(Ordering::Relaxed) {
            let min_age = older_than_days.map(|days| Duration::from_secs(u64::from(days) * SECS_PER_DAY));
            count += self.delete_durable_older_than(min_age).await;
        }

        info!(count, ?older_than_days, "Cache cleared");
        self.events.publish(CoreEvent::CacheCleared {
            count,
            older_than_days,
        });
        count
    }

    /// Delete durable entries older than the configured max age.
    pub async fn sweep_expired(&self) -> usize {
        if !self.durable_enabled.load(Ordering::Relaxed) {
            return 0;
        }
        let count = self.delete_durable_older_than(Some(self.max_age)).await;
        if count > 0 {
            info!(count, "Swept expired cache entries");
        }
        count
    }

    async fn delete_durable_older_than(&self, min_age: Option<Duration>) -> usize {
        let entries = match self.durable.list().await {
            Ok(entries) => entries,
            Err(e) => {
                self.record_error(None, e);
                return 0;
            }
        };

        let mut count = 0;
        for (key, modified) in entries {
            let old_enough = min_age.is_none_or(|min| age_of(modified) >= min);
            if !old_enough {
                continue;
            }
            match self.durable.delete(&key).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => self.record_error(Some(&key), e),
            }
        }
        count
    }

    /// Resize the memory tier, keeping the most recently used entries.
    pub async fn set_memory_capacity(&self, capacity: usize) -> Result<(), CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::ZeroCapacity)?;
        self.memory.lock().await.resize(capacity);
        self.events.publish(CoreEvent::CacheCapacityChanged {
            capacity: capacity.get(),
        });
        Ok(())
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Null results are returned but not stored.
    pub async fn get_or_insert_with<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = fetch().await?;
        if !value.is_null() {
            self.put(key, value.clone()).await;
        }
        Ok(value)
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_size, memory_capacity) = {
            let memory = self.memory.lock().await;
            (memory.len(), memory.capacity())
        };
        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let durable_hits = self.counters.durable_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);

        CacheStats {
            memory_hits,
            durable_hits,
            misses,
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: stats::hit_rate(memory_hits + durable_hits, misses),
            memory_size,
            memory_capacity,
            max_age_secs: self.max_age.as_secs(),
            enabled: self.enabled.load(Ordering::Relaxed),
            memory_enabled: self.memory_enabled.load(Ordering::Relaxed),
            durable_enabled: self.durable_enabled.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_memory_enabled(&self, enabled: bool) {
        self.memory_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_durable_enabled(&self, enabled: bool) {
        self.durable_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Stop the background sweeper.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        debug!("Cache sweeper stopped");
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        age_of(modified) > self.max_age
    }

    fn record_error(&self, key: Option<&str>, error: CacheError) {
        Counters::bump(&self.counters.errors);
        warn!(key = key.unwrap_or("-"), error = %error, "Cache operation failed");
        self.events.publish(CoreEvent::CacheError {
            key: key.map(str::to_string),
            message: error.to_string(),
        });
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Age relative to now. Modification times in the future count as fresh.
fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default()
}

fn spawn_sweeper(
    cache: Weak<TieredCache>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    cache.sweep_expired().await;
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs::File;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    /// In-memory durable store whose reads take a while to return.
    #[derive(Default)]
    struct SlowStore {
        entries: std::sync::Mutex<HashMap<String, Value>>,
    }

    impl SlowStore {
        fn seeded(key: &str, value: Value) -> Arc<Self> {
            let store = Self::default();
            store.entries.lock().unwrap().insert(key.to_string(), value);
            Arc::new(store)
        }

        fn value(&self, key: &str) -> Option<Value> {
            self.entries.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl DurableStore for SlowStore {
        async fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
            let value = self.value(key);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(value.map(|value| StoredEntry {
                value,
                modified: SystemTime::now(),
            }))
        }

        async fn store(&self, key: &str, value: &Value) -> Result<(), CacheError> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }

        async fn list(&self) -> Result<Vec<(String, SystemTime)>, CacheError> {
            let now = SystemTime::now();
            Ok(self
                .entries
                .lock()
                .unwrap()
                .keys()
                .map(|key| (key.clone(), now))
                .collect())
        }
    }

    fn cache_in(dir: &TempDir, capacity: usize) -> Arc<TieredCache> {
        let config = CacheConfig {
            memory_capacity: capacity,
            ..CacheConfig::with_dir(dir.path())
        };
        TieredCache::new(config, EventBus::new()).unwrap()
    }

    fn backdate(dir: &TempDir, key: &str, age: Duration) {
        let file = File::options()
            .write(true)
            .open(dir.path().join(format!("{key}.json")))
            .unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn put_then_get_hits_memory() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 10);

        assert!(cache.get("k").await.is_none());
        cache.put("k", json!({"definition": "x"})).await;
        assert_eq!(cache.get("k").await, Some(json!({"definition": "x"})));

        let stats = cache.stats().await;
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn durable_hit_backfills_memory() {
        let dir = TempDir::new().unwrap();
        let first = cache_in(&dir, 10);
        first.put("k", json!("v")).await;
        first.shutdown().await;
        drop(first);

        let second = cache_in(&dir, 10);
        assert_eq!(second.get("k").await, Some(json!("v")));
        assert_eq!(second.get("k").await, Some(json!("v")));

        let stats = second.stats().await;
        assert_eq!(stats.durable_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.memory_size, 1);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn expired_durable_entry_is_a_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 10);
        cache.set_memory_enabled(false);
        cache.put("old", json!(1)).await;
        backdate(&dir, "old", Duration::from_secs(2 * SECS_PER_DAY));

        assert!(cache.get("old").await.is_none());
        assert!(!dir.path().join("old.json").exists());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn remove_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 10);
        cache.put("k", json!(1)).await;

        assert!(cache.remove("k").await);
        assert!(cache.get("k").await.is_none());
        assert!(!cache.remove("k").await);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn clear_by_age_keeps_recent_durable_entries() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 10);
        cache.put("old", json!(1)).await;
        cache.put("new", json!(2)).await;
        backdate(&dir, "old", Duration::from_secs(10 * SECS_PER_DAY));

        // both memory entries plus the one old durable entry
        assert_eq!(cache.clear(Some(7)).await, 3);
        assert!(dir.path().join("new.json").exists());
        assert_eq!(cache.get("new").await, Some(json!(2)));

        assert_eq!(cache.clear(None).await, 2);
        assert!(cache.get("new").await.is_none());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 10);
        cache.put("stale", json!(1)).await;
        cache.put("fresh", json!(2)).await;
        backdate(&dir, "stale", Duration::from_secs(SECS_PER_DAY + 60));

        assert_eq!(cache.sweep_expired().await, 1);
        assert!(!dir.path().join("stale.json").exists());
        assert!(dir.path().join("fresh.json").exists());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn capacity_change_keeps_recent_entries() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 3);
        cache.set_durable_enabled(false);
        for key in ["a", "b", "c"] {
            cache.put(key, json!(key)).await;
        }
        cache.get("a").await;

        cache.set_memory_capacity(2).await.unwrap();
        assert_eq!(cache.stats().await.memory_capacity, 2);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("b").await.is_none());

        assert!(matches!(
            cache.set_memory_capacity(0).await,
            Err(CacheError::ZeroCapacity)
        ));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 3);
        cache.set_enabled(false);
        cache.put("k", json!(1)).await;
        assert!(cache.get("k").await.is_none());

        cache.set_enabled(true);
        assert!(cache.get("k").await.is_none());
        assert!(!dir.path().join("k.json").exists());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_durable_entry_counts_as_error_and_miss() {
        let dir = TempDir::new().unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cache = TieredCache::new(CacheConfig::with_dir(dir.path()), events).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{oops").unwrap();

        assert!(cache.get("bad").await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.misses, 1);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::CacheError { key, .. } = event {
                assert_eq!(key.as_deref(), Some("bad"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn get_or_insert_with_skips_nulls() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 3);

        let value: Result<Value, CacheError> = cache
            .get_or_insert_with("n", || async { Ok(Value::Null) })
            .await;
        assert_eq!(value.unwrap(), Value::Null);
        assert!(cache.get("n").await.is_none());

        let value: Result<Value, CacheError> = cache
            .get_or_insert_with("v", || async { Ok(json!(7)) })
            .await;
        assert_eq!(value.unwrap(), json!(7));

        let cached: Result<Value, CacheError> = cache
            .get_or_insert_with("v", || async {
                let cached_already = true;
                if cached_already {
                    panic!("fetch should not run");
                }
                Ok(json!(0))
            })
            .await;
        assert_eq!(cached.unwrap(), json!(7));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn slow_durable_read_does_not_overwrite_newer_put() {
        let store = SlowStore::seeded("k", json!("v1"));
        let cache =
            TieredCache::with_store(CacheConfig::default(), store.clone(), EventBus::new()).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.put("k", json!("v2")).await;

        assert_eq!(reader.await.unwrap(), Some(json!("v1")));
        assert_eq!(store.value("k"), Some(json!("v2")));
        assert_eq!(cache.get("k").await, Some(json!("v2")));
        assert_eq!(cache.stats().await.memory_hits, 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn slow_durable_read_does_not_restore_removed_entry() {
        let store = SlowStore::seeded("k", json!("v1"));
        let cache =
            TieredCache::with_store(CacheConfig::default(), store.clone(), EventBus::new()).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.remove("k").await);

        assert_eq!(reader.await.unwrap(), Some(json!("v1")));
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().await.memory_size, 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn background_sweeper_removes_expired_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            max_age: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(20),
            ..CacheConfig::with_dir(dir.path())
        };
        let cache = TieredCache::new(config, EventBus::new()).unwrap();
        cache.put("stale", json!(1)).await;
        cache.put("fresh", json!(2)).await;
        backdate(&dir, "stale", Duration::from_secs(120));

        let stale = dir.path().join("stale.json");
        tokio::time::timeout(Duration::from_secs(5), async {
            while stale.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(dir.path().join("fresh.json").exists());

        cache.shutdown().await;
        assert!(cache.sweeper.lock().await.is_none());

        cache.put("later", json!(3)).await;
        backdate(&dir, "later", Duration::from_secs(120));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dir.path().join("later.json").exists());
    }

    #[tokio::test]
    async fn keys_outside_file_alphabet_stay_in_memory() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 3);

        cache.put("entry/jablko", json!(1)).await;
        assert_eq!(cache.get("entry/jablko").await, Some(json!(1)));
        assert_eq!(cache.stats().await.errors, 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 3);
        cache.get("missing").await;
        cache.reset_stats();
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
        cache.shutdown().await;
    }
}
