//! Retry policy — retry decisions and exponential backoff with jitter.
//!
//! A [`RetryPolicy`] is immutable configuration plus two pure operations:
//! [`RetryPolicy::should_retry`] and [`RetryPolicy::delay_for`]. Call sites
//! compose them explicitly, either by hand (the request queue reschedules
//! through its own timer) or through [`run_with_retry`].

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Coarse failure classes a policy can opt into retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Connection,
    Timeout,
    RateLimited,
    Server,
    Io,
}

/// Exposes what the retry policy needs to know about a failure.
pub trait Classify: std::fmt::Display {
    /// Status code attached to the failure, if any (HTTP-like).
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Failure category, if the error type knows it.
    fn category(&self) -> Option<FailureCategory> {
        None
    }
}

impl Classify for EngineError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::RateLimited { .. } => Some(FailureCategory::RateLimited),
            Self::Status { code, .. } if *code == 429 => Some(FailureCategory::RateLimited),
            Self::Status { code, .. } if (500..600).contains(code) => {
                Some(FailureCategory::Server)
            }
            Self::Connection(_) => Some(FailureCategory::Connection),
            Self::Timeout(_) => Some(FailureCategory::Timeout),
            _ => None,
        }
    }
}

impl Classify for std::io::Error {
    fn category(&self) -> Option<FailureCategory> {
        use std::io::ErrorKind::*;

        Some(match self.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe => FailureCategory::Connection,
            TimedOut => FailureCategory::Timeout,
            _ => FailureCategory::Io,
        })
    }
}

impl Classify for anyhow::Error {
    fn status_code(&self) -> Option<u16> {
        self.downcast_ref::<EngineError>()
            .and_then(Classify::status_code)
    }

    fn category(&self) -> Option<FailureCategory> {
        if let Some(engine) = self.downcast_ref::<EngineError>() {
            return engine.category();
        }
        self.downcast_ref::<std::io::Error>()
            .and_then(Classify::category)
    }
}

static CONNECTION_HINTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection|connect error|network|reset by peer|broken pipe|dns")
        .expect("connection hint pattern")
});

static TIMEOUT_HINTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timed?\s*out|timeout|deadline exceeded").expect("timeout hint pattern")
});

static THROTTLE_HINTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate.?limit|too many requests|throttl|overloaded|temporarily unavailable|quota",
    )
    .expect("throttle hint pattern")
});

/// Guess a failure category from free-form error text.
pub fn infer_category(message: &str) -> Option<FailureCategory> {
    if THROTTLE_HINTS.is_match(message) {
        Some(FailureCategory::RateLimited)
    } else if TIMEOUT_HINTS.is_match(message) {
        Some(FailureCategory::Timeout)
    } else if CONNECTION_HINTS.is_match(message) {
        Some(FailureCategory::Connection)
    } else {
        None
    }
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Fraction of the delay used as the ± jitter range (0.0–1.0).
    pub jitter_factor: f64,
    pub retry_codes: HashSet<u16>,
    pub retry_categories: HashSet<FailureCategory>,
    /// Inspect error text when no status code is available.
    pub message_heuristics: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.2,
            retry_codes: HashSet::new(),
            retry_categories: HashSet::new(),
            message_heuristics: false,
        }
    }
}

impl RetryPolicy {
    /// Policy for calls to the remote generation service.
    pub fn api() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retry_codes: HashSet::from([429, 500, 502, 503, 504]),
            retry_categories: HashSet::from([
                FailureCategory::Connection,
                FailureCategory::Timeout,
                FailureCategory::Io,
                FailureCategory::RateLimited,
            ]),
            ..Self::default()
        }
    }

    /// Policy for local storage operations.
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            retry_categories: HashSet::from([
                FailureCategory::Connection,
                FailureCategory::Timeout,
                FailureCategory::Io,
            ]),
            ..Self::default()
        }
    }

    /// Policy for generic network operations.
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retry_categories: HashSet::from([
                FailureCategory::Connection,
                FailureCategory::Timeout,
                FailureCategory::Io,
            ]),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter; `factor` is clamped to 0.0–1.0.
    pub fn with_jitter(mut self, enabled: bool, factor: f64) -> Self {
        self.jitter = enabled;
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_message_heuristics(mut self, enabled: bool) -> Self {
        self.message_heuristics = enabled;
        self
    }

    /// Whether a failure at `attempt` (0-based) should be retried.
    ///
    /// Unclassified failures are never retried unless message heuristics
    /// are enabled and the text points at a retryable category.
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }

        if error
            .category()
            .is_some_and(|c| self.retry_categories.contains(&c))
        {
            return true;
        }

        match error.status_code() {
            Some(code) => self.retry_codes.contains(&code),
            None if self.message_heuristics => infer_category(&error.to_string())
                .is_some_and(|c| self.retry_categories.contains(&c)),
            None => false,
        }
    }

    /// Unjittered backoff for `attempt`: `min(max_delay, base * factor^attempt)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        // an overflowed (infinite) product clamps to max_delay
        let secs = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Backoff for `attempt`, perturbed by ± `delay * jitter_factor` when
    /// jitter is enabled. Never negative.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        // public field, so NaN or out-of-range values can arrive unchecked
        let factor = if self.jitter_factor.is_finite() {
            self.jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.jitter || factor == 0.0 || base.is_zero() {
            return base;
        }

        let delay = base.as_secs_f64();
        let spread = delay * factor;
        let jittered = delay + rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `policy` declines another attempt.
///
/// `on_retry` receives the failure, the upcoming retry number (1-based) and
/// the delay about to be slept. The last error is returned unchanged.
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, E>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E, u32, Duration),
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(&e, attempt) => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying operation");
                on_retry(&e, attempt, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
