//! Lexigen — async execution core for dictionary generation.
//!
//! - `worker` — prioritized background tasks on a fixed worker pool
//! - `requests` — admission-capped engine requests with retries
//! - `cache` — memory + durable tiered cache for engine results
//! - `retry` — backoff policy and failure classification
//! - `events` — broadcast notifications for logging and UI layers
//! - `services` — one-call wiring of all of the above

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod requests;
pub mod retry;
pub mod services;
pub mod worker;

pub use error::{Error, Result};
