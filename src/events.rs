//! Event bus — one-way, fire-and-forget notifications for logging and UI layers.
//!
//! Every state transition in the scheduler, the request queue and the cache is
//! published as a [`CoreEvent`]. Publishing never blocks and never fails; if
//! nobody is subscribed the event is simply dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::requests::model::RequestKind;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Which cache tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Memory,
    Durable,
}

/// Notifications emitted by the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    // ── Tasks ───────────────────────────────────────────────────────
    WorkersStarted {
        worker_count: usize,
    },
    TaskSubmitted {
        task_id: Uuid,
        name: String,
        priority: i32,
    },
    TaskStarted {
        task_id: Uuid,
        name: String,
    },
    TaskProgress {
        task_id: Uuid,
        progress: f64,
    },
    TaskCompleted {
        task_id: Uuid,
        name: String,
        result: Value,
    },
    TaskFailed {
        task_id: Uuid,
        name: String,
        error: String,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskCallbackError {
        task_id: Uuid,
        error: String,
    },
    TasksEvicted {
        count: usize,
    },
    SchedulerShutdown,

    // ── Requests ────────────────────────────────────────────────────
    RequestCreated {
        request_id: Uuid,
        kind: RequestKind,
        max_retries: u32,
    },
    RequestStarted {
        request_id: Uuid,
        kind: RequestKind,
        attempt: u32,
    },
    RequestRetry {
        request_id: Uuid,
        kind: RequestKind,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    RequestCompleted {
        request_id: Uuid,
        kind: RequestKind,
        attempts: u32,
    },
    RequestFailed {
        request_id: Uuid,
        kind: RequestKind,
        error: String,
    },
    RequestCancelled {
        request_id: Uuid,
    },
    RequestsCancelled {
        count: usize,
    },
    /// A failure with no caller-supplied error callback.
    RequestError {
        request_id: Uuid,
        kind: RequestKind,
        message: String,
    },

    // ── Cache ───────────────────────────────────────────────────────
    CacheHit {
        key: String,
        tier: CacheTier,
    },
    CacheMiss {
        key: String,
    },
    CacheStored {
        key: String,
    },
    CacheRemoved {
        key: String,
    },
    CacheCleared {
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        older_than_days: Option<u32>,
    },
    CacheCapacityChanged {
        capacity: usize,
    },
    CacheError {
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        message: String,
    },
}

impl CoreEvent {
    /// Namespaced event name, e.g. `task:started` or `cache:hit`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkersStarted { .. } => "async:workers_started",
            Self::TaskSubmitted { .. } => "task:submitted",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::TaskCallbackError { .. } => "task:callback_error",
            Self::TasksEvicted { .. } => "tasks:evicted",
            Self::SchedulerShutdown => "async:shutdown",
            Self::RequestCreated { .. } => "request:created",
            Self::RequestStarted { .. } => "request:started",
            Self::RequestRetry { .. } => "request:retry",
            Self::RequestCompleted { .. } => "request:completed",
            Self::RequestFailed { .. } => "request:failed",
            Self::RequestCancelled { .. } => "request:cancelled",
            Self::RequestsCancelled { .. } => "request:all_cancelled",
            Self::RequestError { .. } => "error:request",
            Self::CacheHit { .. } => "cache:hit",
            Self::CacheMiss { .. } => "cache:miss",
            Self::CacheStored { .. } => "cache:item_added",
            Self::CacheRemoved { .. } => "cache:item_removed",
            Self::CacheCleared { .. } => "cache:cleared",
            Self::CacheCapacityChanged { .. } => "cache:capacity_changed",
            Self::CacheError { .. } => "error:cache",
        }
    }
}

/// Broadcast fan-out of [`CoreEvent`]s. Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Ok if no receivers are listening.
    pub fn publish(&self, event: CoreEvent) {
        tracing::debug!(event = event.name(), "Core event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`. Lagged receivers yield an error item and continue.
    pub fn stream(&self) -> BroadcastStream<CoreEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
