//! Request queue — bounded-concurrency dispatch of engine calls with retries.
//!
//! A single dispatch loop admits pending requests while fewer than
//! `max_concurrent` are processing, spawning one execution per admitted
//! request. Failed attempts are classified by the retry policy; retryable
//! ones wait out their backoff outside the active set and are re-admitted
//! ahead of newer work. Terminal requests move into a bounded history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RequestQueueConfig;
use crate::error::{EngineError, RequestError};
use crate::events::{CoreEvent, EventBus};
use crate::requests::engine::{self, Engine};
use crate::requests::model::{
    QueueStats, RequestCallbacks, RequestKind, RequestOptions, RequestOutcome, RequestParams,
    RequestSnapshot, RequestStatus, RetryRecord,
};
use crate::retry::RetryPolicy;
use crate::worker::scheduler::panic_message;

struct RequestRecord {
    id: Uuid,
    params: RequestParams,
    status: RequestStatus,
    options: RequestOptions,
    attempts: u32,
    retry_history: Vec<RetryRecord>,
    result: Option<Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    callbacks: RequestCallbacks,
    completion: Option<oneshot::Sender<RequestOutcome>>,
}

impl RequestRecord {
    fn set_status(&mut self, status: RequestStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id,
            kind: self.params.kind(),
            params: self.params.clone(),
            status: self.status,
            attempts: self.attempts,
            max_retries: self.options.max_retries,
            retry_history: self.retry_history.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

struct QueueState {
    /// Requests that have not reached a terminal state.
    live: HashMap<Uuid, RequestRecord>,
    pending: VecDeque<Uuid>,
    /// Requests holding an admission slot, including cancelled ones still in flight.
    active: HashSet<Uuid>,
    history: LruCache<Uuid, RequestSnapshot>,
}

impl QueueState {
    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            active: self.active.len(),
            ..Default::default()
        };

        for record in self.live.values() {
            match record.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Retrying => stats.retrying += 1,
                _ => {}
            }
            count_retries(&mut stats, record.retry_history.len());
        }

        for (_, snapshot) in self.history.iter() {
            match snapshot.status {
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
            count_retries(&mut stats, snapshot.retry_history.len());
        }

        stats
    }

    /// Move a live request to history as cancelled.
    fn cancel(&mut self, id: Uuid) -> Option<RequestRecord> {
        let mut record = self.live.remove(&id)?;
        self.pending.retain(|queued| *queued != id);
        record.set_status(RequestStatus::Cancelled);
        self.history.put(id, record.snapshot());
        Some(record)
    }
}

fn count_retries(stats: &mut QueueStats, retries: usize) {
    if retries > 0 {
        stats.total_retries += retries as u32;
        stats.retried_request_count += 1;
    }
}

struct Admitted {
    id: Uuid,
    kind: RequestKind,
    params: RequestParams,
    attempt: u32,
}

struct Inner {
    config: RequestQueueConfig,
    engine: Arc<dyn Engine>,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    stats_tx: watch::Sender<QueueStats>,
    events: EventBus,
}

impl Inner {
    fn publish_stats(&self, state: &QueueState) {
        self.stats_tx.send_replace(state.stats());
    }

    fn policy_for(&self, options: &RequestOptions) -> RetryPolicy {
        self.config
            .retry
            .clone()
            .with_max_retries(options.max_retries)
            .with_base_delay(options.base_delay)
    }

    /// Take the next pending request if an admission slot is free.
    async fn admit_next(&self) -> Option<Admitted> {
        let admitted = {
            let mut state = self.state.lock().await;
            if state.active.len() >= self.config.max_concurrent.max(1) {
                return None;
            }

            let admitted = loop {
                let id = state.pending.pop_front()?;
                let Some(record) = state.live.get_mut(&id) else {
                    continue;
                };
                if record.status != RequestStatus::Pending {
                    continue;
                }
                record.attempts += 1;
                record.set_status(RequestStatus::Processing);
                break Admitted {
                    id,
                    kind: record.params.kind(),
                    params: record.params.clone(),
                    attempt: record.attempts,
                };
            };

            state.active.insert(admitted.id);
            self.publish_stats(&state);
            admitted
        };

        debug!(request_id = %admitted.id, kind = %admitted.kind, attempt = admitted.attempt, "Request admitted");
        self.events.publish(CoreEvent::RequestStarted {
            request_id: admitted.id,
            kind: admitted.kind,
            attempt: admitted.attempt,
        });
        Some(admitted)
    }

    async fn run_attempt(self: Arc<Self>, admitted: Admitted) {
        let backend = Arc::clone(&self.engine);
        let params = admitted.params.clone();
        let outcome = AssertUnwindSafe(async move { engine::dispatch(backend.as_ref(), &params).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(EngineError::Other(format!(
                    "engine panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(value) => self.finish(admitted.id, Ok(value)).await,
            Err(error) => self.handle_failure(admitted, error).await,
        }
        self.wake.notify_one();
    }

    async fn handle_failure(self: &Arc<Self>, admitted: Admitted, error: EngineError) {
        let message = error.to_string();

        let delay = {
            let mut state = self.state.lock().await;
            let Some(record) = state.live.get_mut(&admitted.id) else {
                // Cancelled while in flight
                state.active.remove(&admitted.id);
                self.publish_stats(&state);
                return;
            };

            let policy = self.policy_for(&record.options);
            let retries_so_far = record.attempts.saturating_sub(1);
            if !policy.should_retry(&error, retries_so_far) {
                None
            } else {
                let mut delay = policy.delay_for(retries_so_far);
                if let EngineError::RateLimited {
                    retry_after: Some(after),
                } = &error
                {
                    delay = delay.max((*after).min(policy.max_delay));
                }

                record.error = Some(message.clone());
                record.retry_history.push(RetryRecord {
                    attempt: record.attempts,
                    timestamp: Utc::now(),
                    error: message.clone(),
                    delay_ms: delay.as_millis() as u64,
                });
                record.set_status(RequestStatus::Retrying);
                state.active.remove(&admitted.id);
                self.publish_stats(&state);
                Some(delay)
            }
        };

        let Some(delay) = delay else {
            self.finish(admitted.id, Err(message)).await;
            return;
        };

        warn!(
            request_id = %admitted.id,
            kind = %admitted.kind,
            attempt = admitted.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Request failed, retrying"
        );
        self.events.publish(CoreEvent::RequestRetry {
            request_id: admitted.id,
            kind: admitted.kind,
            attempt: admitted.attempt,
            delay_ms: delay.as_millis() as u64,
            error: message,
        });

        let inner = Arc::clone(self);
        let id = admitted.id;
        tokio::spawn(async move {
            let mut shutdown_rx = inner.shutdown_tx.subscribe();
            if *shutdown_rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.readmit(id).await,
                _ = shutdown_rx.changed() => {}
            }
        });
    }

    /// Put a retrying request back at the head of the pending queue.
    async fn readmit(&self, id: Uuid) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.live.get_mut(&id) else {
                return;
            };
            if record.status != RequestStatus::Retrying {
                return;
            }
            record.set_status(RequestStatus::Pending);
            state.pending.push_front(id);
            self.publish_stats(&state);
        }
        debug!(request_id = %id, "Request re-queued after backoff");
        self.wake.notify_one();
    }

    /// Record a terminal outcome, then notify the caller outside the lock.
    async fn finish(&self, id: Uuid, outcome: Result<Value, String>) {
        let record = {
            let mut state = self.state.lock().await;
            state.active.remove(&id);
            let Some(mut record) = state.live.remove(&id) else {
                debug!(request_id = %id, "Discarding result of cancelled request");
                self.publish_stats(&state);
                return;
            };

            match &outcome {
                Ok(value) => {
                    record.result = Some(value.clone());
                    record.error = None;
                    record.set_status(RequestStatus::Completed);
                }
                Err(error) => {
                    record.error = Some(error.clone());
                    record.set_status(RequestStatus::Failed);
                }
            }
            state.history.put(id, record.snapshot());
            self.publish_stats(&state);
            record
        };

        let kind = record.params.kind();
        let RequestRecord {
            attempts,
            callbacks,
            completion,
            ..
        } = record;

        match outcome {
            Ok(value) => {
                info!(request_id = %id, %kind, attempts, "Request completed");
                self.events.publish(CoreEvent::RequestCompleted {
                    request_id: id,
                    kind,
                    attempts,
                });
                if let Some(tx) = completion {
                    let _ = tx.send(Ok(value.clone()));
                }
                if let Some(on_success) = callbacks.on_success {
                    invoke_callback(id, || on_success(value));
                }
            }
            Err(error) => {
                warn!(request_id = %id, %kind, attempts, %error, "Request failed");
                self.events.publish(CoreEvent::RequestFailed {
                    request_id: id,
                    kind,
                    error: error.clone(),
                });

                let awaited = completion.is_some();
                if let Some(tx) = completion {
                    let _ = tx.send(Err(RequestError::Failed {
                        id,
                        attempts,
                        reason: error.clone(),
                    }));
                }
                match callbacks.on_error {
                    Some(on_error) => invoke_callback(id, || on_error(error)),
                    None if !awaited => {
                        self.events.publish(CoreEvent::RequestError {
                            request_id: id,
                            kind,
                            message: error,
                        });
                    }
                    None => {}
                }
            }
        }
    }
}

fn invoke_callback(id: Uuid, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(request_id = %id, error = %panic_message(panic.as_ref()), "Request callback panicked");
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }

        while let Some(admitted) = inner.admit_next().await {
            tokio::spawn(Arc::clone(&inner).run_attempt(admitted));
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
    debug!("Request dispatch loop stopped");
}

/// Handle for an awaitable request. Resolves once the request is terminal.
#[derive(Debug)]
pub struct RequestTicket {
    id: Uuid,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for RequestTicket {
    type Output = RequestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Cancelled { id })))
    }
}

/// Orchestrates engine requests under an admission cap.
pub struct RequestQueue {
    inner: Arc<Inner>,
    accepting: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueue {
    /// Start the dispatch loop. Must be called inside a tokio runtime.
    pub fn new(config: RequestQueueConfig, engine: Arc<dyn Engine>, events: EventBus) -> Arc<Self> {
        let history_capacity =
            NonZeroUsize::new(config.history_capacity).unwrap_or(NonZeroUsize::MIN);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (stats_tx, _stats_rx) = watch::channel(QueueStats::default());

        let inner = Arc::new(Inner {
            config,
            engine,
            state: Mutex::new(QueueState {
                live: HashMap::new(),
                pending: VecDeque::new(),
                active: HashSet::new(),
                history: LruCache::new(history_capacity),
            }),
            wake: Notify::new(),
            shutdown_tx,
            stats_tx,
            events,
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        info!(
            max_concurrent = inner.config.max_concurrent,
            "Request queue started"
        );

        Arc::new(Self {
            inner,
            accepting: AtomicBool::new(true),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Options built from the configured defaults.
    pub fn default_options(&self) -> RequestOptions {
        RequestOptions {
            max_retries: self.inner.config.default_max_retries,
            base_delay: self.inner.config.default_base_delay,
        }
    }

    /// Enqueue with the default retry options.
    pub async fn enqueue(
        &self,
        params: impl Into<RequestParams>,
        callbacks: RequestCallbacks,
    ) -> Result<Uuid, RequestError> {
        let options = self.default_options();
        self.insert(params.into(), options, callbacks, None).await
    }

    pub async fn enqueue_with(
        &self,
        params: impl Into<RequestParams>,
        options: RequestOptions,
        callbacks: RequestCallbacks,
    ) -> Result<Uuid, RequestError> {
        self.insert(params.into(), options, callbacks, None).await
    }

    /// Enqueue and get a ticket that resolves with the outcome.
    pub async fn enqueue_awaitable(
        &self,
        params: impl Into<RequestParams>,
        options: RequestOptions,
    ) -> Result<RequestTicket, RequestError> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .insert(params.into(), options, RequestCallbacks::default(), Some(tx))
            .await?;
        Ok(RequestTicket { id, rx })
    }

    async fn insert(
        &self,
        params: RequestParams,
        options: RequestOptions,
        callbacks: RequestCallbacks,
        completion: Option<oneshot::Sender<RequestOutcome>>,
    ) -> Result<Uuid, RequestError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RequestError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let kind = params.kind();
        let now = Utc::now();
        let record = RequestRecord {
            id,
            params,
            status: RequestStatus::Pending,
            options,
            attempts: 0,
            retry_history: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            callbacks,
            completion,
        };

        {
            let mut state = self.inner.state.lock().await;
            state.live.insert(id, record);
            state.pending.push_back(id);
            self.inner.publish_stats(&state);

            // Published under the lock so `request_created` precedes `request_started`
            debug!(request_id = %id, %kind, max_retries = options.max_retries, "Request enqueued");
            self.inner.events.publish(CoreEvent::RequestCreated {
                request_id: id,
                kind,
                max_retries: options.max_retries,
            });
        }
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Cancel a pending, retrying or in-flight request.
    ///
    /// An in-flight attempt runs to completion but its result is discarded.
    pub async fn cancel(&self, request_id: Uuid) -> bool {
        let record = {
            let mut state = self.inner.state.lock().await;
            let record = state.cancel(request_id);
            if record.is_some() {
                self.inner.publish_stats(&state);
            }
            record
        };

        let Some(record) = record else {
            return false;
        };
        self.resolve_cancelled(record);
        info!(request_id = %request_id, "Request cancelled");
        true
    }

    pub async fn cancel_all(&self) -> usize {
        let cancelled: Vec<RequestRecord> = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<Uuid> = state.live.keys().copied().collect();
            let cancelled = ids.into_iter().filter_map(|id| state.cancel(id)).collect();
            self.inner.publish_stats(&state);
            cancelled
        };

        let count = cancelled.len();
        for record in cancelled {
            self.resolve_cancelled(record);
        }
        if count > 0 {
            info!(count, "Cancelled all requests");
            self.inner
                .events
                .publish(CoreEvent::RequestsCancelled { count });
        }
        count
    }

    fn resolve_cancelled(&self, record: RequestRecord) {
        let id = record.id;
        if let Some(tx) = record.completion {
            let _ = tx.send(Err(RequestError::Cancelled { id }));
        }
        self.inner
            .events
            .publish(CoreEvent::RequestCancelled { request_id: id });
    }

    pub async fn status_of(&self, request_id: Uuid) -> Option<RequestStatus> {
        let state = self.inner.state.lock().await;
        match state.live.get(&request_id) {
            Some(record) => Some(record.status),
            None => state.history.peek(&request_id).map(|s| s.status),
        }
    }

    pub async fn snapshot(&self, request_id: Uuid) -> Option<RequestSnapshot> {
        let state = self.inner.state.lock().await;
        match state.live.get(&request_id) {
            Some(record) => Some(record.snapshot()),
            None => state.history.peek(&request_id).cloned(),
        }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.inner.state.lock().await.stats()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    pub async fn pending_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state
            .live
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .count()
    }

    /// Observe queue statistics; refreshed after every state change.
    pub fn on_queue_changed(&self) -> watch::Receiver<QueueStats> {
        self.inner.stats_tx.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Cancel everything and stop the dispatch loop, waiting at most
    /// `shutdown_timeout` for it to exit.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        let cancelled = self.cancel_all().await;
        self.inner.shutdown_tx.send_replace(true);
        self.inner.wake.notify_one();

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(handle) = dispatcher {
            let abort = handle.abort_handle();
            let timeout = self.inner.config.shutdown_timeout;
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Dispatch loop did not stop in time, aborting"
                );
                abort.abort();
            }
        }

        info!(cancelled, "Request queue shut down");
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}
