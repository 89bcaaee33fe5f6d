//! Cache hit/miss accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub memory_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    pub misses: AtomicU64,
    pub errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.durable_hits,
            &self.misses,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub errors: u64,
    /// Hits as a percentage of lookups, 0 when nothing was looked up.
    pub hit_rate: f64,
    pub memory_size: usize,
    pub memory_capacity: usize,
    pub max_age_secs: u64,
    pub enabled: bool,
    pub memory_enabled: bool,
    pub durable_enabled: bool,
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let lookups = hits + misses;
    if lookups == 0 {
        0.0
    } else {
        hits as f64 / lookups as f64 * 100.0
    }
}
