//! Tracing subscriber setup for applications embedding the core.

use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"info"` or `"lexigen=debug"`).
///
/// Returns an error instead of panicking if a global subscriber is already set.
pub fn init(default_filter: &str) -> Result<(), ConfigError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}
