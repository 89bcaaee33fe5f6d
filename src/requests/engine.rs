//! Generation engine boundary.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::requests::model::{
    EntryParams, LanguageParams, LanguageValidation, LemmaParams, RegenerateParams, RequestParams,
};

/// Remote generation backend. Implementations own their own timeouts.
///
/// Errors should carry a status code or failure kind where one exists so the
/// retry policy can classify them.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Resolve the dictionary form of a word.
    async fn lemma(&self, params: &LemmaParams) -> Result<String, EngineError>;

    async fn create_entry(&self, params: &EntryParams) -> Result<Value, EngineError>;

    async fn regenerate_entry(&self, params: &RegenerateParams) -> Result<Value, EngineError>;

    async fn validate_language(
        &self,
        params: &LanguageParams,
    ) -> Result<LanguageValidation, EngineError>;
}

/// Invoke the engine operation matching `params`, normalizing the result to JSON.
pub async fn dispatch(engine: &dyn Engine, params: &RequestParams) -> Result<Value, EngineError> {
    match params {
        RequestParams::LemmaLookup(p) => engine.lemma(p).await.map(Value::String),
        RequestParams::EntryCreation(p) => engine.create_entry(p).await,
        RequestParams::EntryRegeneration(p) => engine.regenerate_entry(p).await,
        RequestParams::LanguageValidation(p) => {
            let validation = engine.validate_language(p).await?;
            serde_json::to_value(validation).map_err(|e| EngineError::InvalidResponse(e.to_string()))
        }
    }
}
