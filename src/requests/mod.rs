//! Domain request orchestration.
//!
//! - `model` — request kinds, typed parameters, status, snapshots
//! - `engine` — the generation engine boundary
//! - `queue` — admission-capped dispatch with retries and cancellation
//! - `cached` — engine decorator backed by the tiered cache

pub mod cached;
pub mod engine;
pub mod model;
pub mod queue;

pub use cached::CachingEngine;
pub use engine::Engine;
pub use model::{
    EntryParams, LanguageParams, LanguageValidation, LemmaParams, QueueStats, RegenerateParams,
    RequestCallbacks, RequestKind, RequestOptions, RequestParams, RequestSnapshot, RequestStatus,
    RetryRecord,
};
pub use queue::{RequestQueue, RequestTicket};
