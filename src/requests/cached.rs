//! Engine decorator that serves repeat requests from a [`TieredCache`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::TieredCache;
use crate::error::EngineError;
use crate::requests::engine::Engine;
use crate::requests::model::{
    EntryParams, LanguageParams, LanguageValidation, LemmaParams, RegenerateParams, RequestKind,
};

/// Wraps an engine with the cache. Regeneration always reaches the engine.
pub struct CachingEngine<E> {
    inner: E,
    cache: Arc<TieredCache>,
}

impl<E: Engine> CachingEngine<E> {
    pub fn new(inner: E, cache: Arc<TieredCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    async fn cached<P, T, F, Fut>(
        &self,
        kind: RequestKind,
        params: &P,
        fetch: F,
    ) -> Result<T, EngineError>
    where
        P: Serialize + Sync,
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, EngineError>> + Send,
    {
        let key = match TieredCache::key(kind.as_str(), params) {
            Ok(key) => key,
            Err(e) => {
                warn!(%kind, error = %e, "Could not build cache key, calling engine directly");
                return fetch().await;
            }
        };

        if let Some(hit) = self.cache.get(&key).await {
            match serde_json::from_value::<T>(hit) {
                Ok(value) => return Ok(value),
                Err(e) => debug!(%kind, error = %e, "Ignoring malformed cache entry"),
            }
        }

        let value = fetch().await?;
        match serde_json::to_value(&value) {
            Ok(Value::Null) => {}
            Ok(json) => self.cache.put(&key, json).await,
            Err(e) => warn!(%kind, error = %e, "Engine result not cacheable"),
        }
        Ok(value)
    }
}

#[async_trait]
impl<E: Engine> Engine for CachingEngine<E> {
    async fn lemma(&self, params: &LemmaParams) -> Result<String, EngineError> {
        self.cached(RequestKind::LemmaLookup, params, || self.inner.lemma(params))
            .await
    }

    async fn create_entry(&self, params: &EntryParams) -> Result<Value, EngineError> {
        self.cached(RequestKind::EntryCreation, params, || {
            self.inner.create_entry(params)
        })
        .await
    }

    async fn regenerate_entry(&self, params: &RegenerateParams) -> Result<Value, EngineError> {
        self.inner.regenerate_entry(params).await
    }

    async fn validate_language(
        &self,
        params: &LanguageParams,
    ) -> Result<LanguageValidation, EngineError> {
        self.cached(RequestKind::LanguageValidation, params, || {
            self.inner.validate_language(params)
        })
        .await
    }
}
