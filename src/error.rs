//! Error types for lexigen.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the execution core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Logging already initialized: {0}")]
    Logging(String),
}

/// Failures raised across the generation engine boundary.
///
/// Each variant keeps enough detail (status code, failure kind) for the
/// retry policy to decide whether another attempt makes sense.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Engine returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Engine call timed out: {0}")]
    Timeout(String),

    #[error("Invalid response from engine: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

/// Task scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Task {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },
}

/// Request queue errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("Request {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Request {id} failed after {attempts} attempt(s): {reason}")]
    Failed {
        id: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("Request queue is shutting down")]
    ShuttingDown,
}

/// Tiered cache errors. Never surfaced as a failure of the cached operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Memory capacity must be greater than zero")]
    ZeroCapacity,
}

/// Result type alias for lexigen.
pub type Result<T> = std::result::Result<T, Error>;
