//! Request data types: kinds, typed parameters, status, snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RequestError;

/// Engine operation a request invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    LemmaLookup,
    EntryCreation,
    EntryRegeneration,
    LanguageValidation,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LemmaLookup => "lemma_lookup",
            Self::EntryCreation => "entry_creation",
            Self::EntryRegeneration => "entry_regeneration",
            Self::LanguageValidation => "language_validation",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a lemma lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LemmaParams {
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Parameters for creating a dictionary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryParams {
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_hint: Option<String>,
}

/// Parameters for regenerating an existing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerateParams {
    pub headword: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_lang: Option<String>,
    pub variation_seed: String,
}

/// Parameters for validating a language name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageParams {
    pub name: String,
}

/// Typed request parameters, one variant per [`RequestKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestParams {
    LemmaLookup(LemmaParams),
    EntryCreation(EntryParams),
    EntryRegeneration(RegenerateParams),
    LanguageValidation(LanguageParams),
}

impl RequestParams {
    pub fn lemma(word: impl Into<String>) -> LemmaParams {
        LemmaParams {
            word: word.into(),
            context: None,
        }
    }

    pub fn entry(word: impl Into<String>) -> EntryParams {
        EntryParams {
            word: word.into(),
            target_lang: None,
            source_lang: None,
            context: None,
            variation_hint: None,
        }
    }

    /// Regeneration always carries a seed so repeated calls yield distinct variants.
    pub fn regenerate(headword: impl Into<String>) -> RegenerateParams {
        RegenerateParams {
            headword: headword.into(),
            target_lang: None,
            source_lang: None,
            definition_lang: None,
            variation_seed: Uuid::new_v4().to_string(),
        }
    }

    pub fn validate_language(name: impl Into<String>) -> LanguageParams {
        LanguageParams { name: name.into() }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::LemmaLookup(_) => RequestKind::LemmaLookup,
            Self::EntryCreation(_) => RequestKind::EntryCreation,
            Self::EntryRegeneration(_) => RequestKind::EntryRegeneration,
            Self::LanguageValidation(_) => RequestKind::LanguageValidation,
        }
    }
}

impl LemmaParams {
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl EntryParams {
    pub fn target_lang(mut self, lang: impl Into<String>) -> Self {
        self.target_lang = Some(lang.into());
        self
    }

    pub fn source_lang(mut self, lang: impl Into<String>) -> Self {
        self.source_lang = Some(lang.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn variation_hint(mut self, hint: impl Into<String>) -> Self {
        self.variation_hint = Some(hint.into());
        self
    }
}

impl RegenerateParams {
    pub fn target_lang(mut self, lang: impl Into<String>) -> Self {
        self.target_lang = Some(lang.into());
        self
    }

    pub fn source_lang(mut self, lang: impl Into<String>) -> Self {
        self.source_lang = Some(lang.into());
        self
    }

    pub fn definition_lang(mut self, lang: impl Into<String>) -> Self {
        self.definition_lang = Some(lang.into());
        self
    }

    pub fn variation_seed(mut self, seed: impl Into<String>) -> Self {
        self.variation_seed = seed.into();
        self
    }
}

impl From<LemmaParams> for RequestParams {
    fn from(p: LemmaParams) -> Self {
        Self::LemmaLookup(p)
    }
}

impl From<EntryParams> for RequestParams {
    fn from(p: EntryParams) -> Self {
        Self::EntryCreation(p)
    }
}

impl From<RegenerateParams> for RequestParams {
    fn from(p: RegenerateParams) -> Self {
        Self::EntryRegeneration(p)
    }
}

impl From<LanguageParams> for RequestParams {
    fn from(p: LanguageParams) -> Self {
        Self::LanguageValidation(p)
    }
}

/// Result of validating a language name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageValidation {
    pub standardized_name: String,
    pub display_name: String,
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    /// Waiting out a backoff delay before re-admission.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One failed attempt that was retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub delay_ms: u64,
}

/// Per-request retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RequestOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

pub type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
pub type FailureCallback = Box<dyn FnOnce(String) + Send>;

/// Completion callbacks. Never invoked for cancelled requests.
#[derive(Default)]
pub struct RequestCallbacks {
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_error: Option<FailureCallback>,
}

impl RequestCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(Value) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for RequestCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Full view of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub id: Uuid,
    pub kind: RequestKind,
    pub params: RequestParams,
    pub status: RequestStatus,
    /// Engine invocations so far, including the one in flight.
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_history: Vec<RetryRecord>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate queue counts for UI refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Retries across every known request.
    pub total_retries: u32,
    /// Known requests that were retried at least once.
    pub retried_request_count: usize,
}

/// Outcome delivered to awaiting callers.
pub type RequestOutcome = Result<Value, RequestError>;
