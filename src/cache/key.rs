//! Deterministic cache keys over canonicalized parameters.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Hash `prefix` and the canonical JSON form of `params` into a hex key.
///
/// Object keys are sorted at every depth, so logically equal parameter sets
/// always produce the same key.
pub fn cache_key<T: Serialize + ?Sized>(prefix: &str, params: &T) -> Result<String, CacheError> {
    let canonical = canonicalize(serde_json::to_value(params)?);
    let serialized = serde_json::to_string(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b":");
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
