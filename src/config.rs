//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Task scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker loops in the pool.
    pub workers: usize,
    /// How long terminal tasks stay queryable before eviction.
    pub retention: Duration,
    /// How often the eviction job runs.
    pub cleanup_interval: Duration,
    /// Upper bound on waiting for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retention: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

/// Request queue configuration.
#[derive(Debug, Clone)]
pub struct RequestQueueConfig {
    /// Admission cap: requests allowed in `processing` at once.
    pub max_concurrent: usize,
    pub default_max_retries: u32,
    pub default_base_delay: Duration,
    /// Terminal requests kept for status queries.
    pub history_capacity: usize,
    /// Dispatch loop fallback poll interval.
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Template policy; per-request retries and base delay override it.
    pub retry: RetryPolicy,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_max_retries: 3,
            default_base_delay: Duration::from_secs(2),
            history_capacity: 100,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(2),
            retry: RetryPolicy::api().with_message_heuristics(true),
        }
    }
}

/// Tiered cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory for the durable tier.
    pub dir: PathBuf,
    pub memory_capacity: usize,
    /// Durable entries older than this are treated as missing.
    pub max_age: Duration,
    pub sweep_interval: Duration,
    pub enabled: bool,
    pub memory_enabled: bool,
    pub durable_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            memory_capacity: 100,
            max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
            sweep_interval: Duration::from_secs(60 * 60), // 1 hour
            enabled: true,
            memory_enabled: true,
            durable_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Configuration for the whole execution core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub requests: RequestQueueConfig,
    pub cache: CacheConfig,
}

impl CoreConfig {
    /// Build config from `LEXIGEN_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CoreConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse_var::<usize>(&lookup, "LEXIGEN_WORKERS")? {
            config.scheduler.workers = workers;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "LEXIGEN_MAX_CONCURRENT_REQUESTS")? {
            config.requests.max_concurrent = max;
        }
        if let Some(dir) = lookup("LEXIGEN_CACHE_DIR") {
            config.cache.dir = PathBuf::from(dir);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "LEXIGEN_CACHE_CAPACITY")? {
            config.cache.memory_capacity = capacity;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LEXIGEN_CACHE_MAX_AGE_SECS")? {
            config.cache.max_age = Duration::from_secs(secs);
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "LEXIGEN_CACHE_ENABLED")? {
            config.cache.enabled = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.scheduler.workers == 0, "scheduler.workers"),
            (self.requests.max_concurrent == 0, "requests.max_concurrent"),
            (self.requests.history_capacity == 0, "requests.history_capacity"),
            (self.cache.memory_capacity == 0, "cache.memory_capacity"),
        ];

        match checks.into_iter().find(|(invalid, _)| *invalid) {
            Some((_, key)) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn parse_var<T>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let config = CoreConfig::default();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.requests.max_concurrent, 3);
        assert_eq!(config.requests.default_max_retries, 3);
        assert_eq!(config.requests.default_base_delay, Duration::from_secs(2));
        assert_eq!(config.requests.history_capacity, 100);
        assert_eq!(config.cache.memory_capacity, 100);
        assert_eq!(config.cache.max_age, Duration::from_secs(86_400));
        assert!(config.requests.retry.message_heuristics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = CoreConfig::default();
        config.scheduler.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheduler.workers"));
    }

    #[test]
    fn validate_rejects_zero_cache_capacity() {
        let mut config = CoreConfig::default();
        config.cache.memory_capacity = 0;
        assert!(config.validate().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_vars_keep_defaults() {
        let config = CoreConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.cache.dir, PathBuf::from("./cache"));
    }

    #[test]
    fn vars_override_defaults() {
        let config = CoreConfig::from_lookup(vars(&[
            ("LEXIGEN_WORKERS", " 8 "),
            ("LEXIGEN_MAX_CONCURRENT_REQUESTS", "5"),
            ("LEXIGEN_CACHE_DIR", "/tmp/lexigen"),
            ("LEXIGEN_CACHE_CAPACITY", "250"),
            ("LEXIGEN_CACHE_MAX_AGE_SECS", "3600"),
            ("LEXIGEN_CACHE_ENABLED", "false"),
        ]))
        .unwrap();
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.requests.max_concurrent, 5);
        assert_eq!(config.cache.dir, PathBuf::from("/tmp/lexigen"));
        assert_eq!(config.cache.memory_capacity, 250);
        assert_eq!(config.cache.max_age, Duration::from_secs(3600));
        assert!(!config.cache.enabled);
    }

    #[test]
    fn unparsable_var_is_invalid_value() {
        let err = CoreConfig::from_lookup(vars(&[("LEXIGEN_WORKERS", "many")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, message } => {
                assert_eq!(key, "LEXIGEN_WORKERS");
                assert!(message.contains("many"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parsed_zero_is_rejected_by_validation() {
        let err = CoreConfig::from_lookup(vars(&[("LEXIGEN_CACHE_CAPACITY", "0")])).unwrap_err();
        assert!(err.to_string().contains("cache.memory_capacity"));
    }
}
