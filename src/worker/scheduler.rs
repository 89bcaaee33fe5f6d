//! Task scheduler — priority-ordered background work on a fixed worker pool.
//!
//! The scheduler provides:
//! - `submit()` — enqueue a unit of work without waiting for it
//! - `cancel()` — drop a task that has not started yet
//! - `get_status()` / `queue_stats()` — polling views for UI layers
//! - `update_progress()` — progress reports from inside running work
//! - a background eviction job for terminal tasks, stopped by `shutdown()`

use std::any::Any;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::events::{CoreEvent, EventBus};
use crate::worker::context::TaskContext;
use crate::worker::state::TaskStatus;
use crate::worker::task::{
    CompleteCallback, ErrorCallback, QueueEntry, Task, TaskFuture, TaskOptions, TaskSnapshot,
    WorkFn,
};

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Entries still in the priority heap, including cancelled ones not yet skipped.
    pub queue_size: usize,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<Uuid, Task>,
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// State shared between the scheduler handle, its workers and task contexts.
pub(crate) struct Shared {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    work_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    events: EventBus,
}

struct ClaimedTask {
    id: Uuid,
    name: String,
    work: WorkFn,
}

enum FinishedCallback {
    Complete(CompleteCallback, Value),
    Error(ErrorCallback, String),
}

impl Shared {
    /// Pop the highest-priority pending task and mark it running.
    async fn claim_next(&self) -> Option<ClaimedTask> {
        let mut state = self.state.lock().await;
        while let Some(entry) = state.queue.pop() {
            let Some(task) = state.tasks.get_mut(&entry.id) else {
                continue;
            };
            // Cancelled while queued
            if task.status != TaskStatus::Pending {
                continue;
            }
            let Some(work) = task.work.take() else {
                continue;
            };
            if let Err(reason) = task.transition_to(TaskStatus::Running) {
                warn!(task_id = %task.id, %reason, "Skipping task");
                continue;
            }
            return Some(ClaimedTask {
                id: task.id,
                name: task.name.clone(),
                work,
            });
        }
        None
    }

    async fn execute(self: &Arc<Self>, claimed: ClaimedTask) {
        let ClaimedTask { id, name, work } = claimed;

        debug!(task_id = %id, task = %name, "Task started");
        self.events.publish(CoreEvent::TaskStarted {
            task_id: id,
            name: name.clone(),
        });

        let ctx = TaskContext::new(id, Arc::clone(self));
        let outcome = AssertUnwindSafe(async move { work(ctx).await })
            .catch_unwind()
            .await;

        let outcome = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(TaskError::Panicked {
                id,
                reason: panic_message(panic.as_ref()),
            }
            .to_string()),
        };

        let callback = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(&id) else {
                debug!(task_id = %id, "Task finished after scheduler state was cleared");
                return;
            };

            match outcome {
                Ok(value) => {
                    let _ = task.transition_to(TaskStatus::Completed);
                    task.result = Some(value.clone());
                    task.on_error = None;
                    self.events.publish(CoreEvent::TaskCompleted {
                        task_id: id,
                        name: name.clone(),
                        result: value.clone(),
                    });
                    task.on_complete
                        .take()
                        .map(|cb| FinishedCallback::Complete(cb, value))
                }
                Err(error) => {
                    let _ = task.transition_to(TaskStatus::Failed);
                    task.error = Some(error.clone());
                    task.on_complete = None;
                    self.events.publish(CoreEvent::TaskFailed {
                        task_id: id,
                        name: name.clone(),
                        error: error.clone(),
                    });
                    warn!(task_id = %id, task = %name, %error, "Task failed");
                    task.on_error
                        .take()
                        .map(|cb| FinishedCallback::Error(cb, error))
                }
            }
        };

        // Callbacks run outside the lock; a panicking callback never reaches the worker loop.
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| match callback {
                FinishedCallback::Complete(cb, value) => cb(value),
                FinishedCallback::Error(cb, error) => cb(error),
            }));
            if let Err(panic) = result {
                let error = panic_message(panic.as_ref());
                warn!(task_id = %id, %error, "Task callback panicked");
                self.events.publish(CoreEvent::TaskCallbackError { task_id: id, error });
            }
        }
    }

    pub(crate) async fn update_progress(&self, task_id: Uuid, progress: f64) -> bool {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };

        let changed = {
            let mut state = self.state.lock().await;
            match state.tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Running => {
                    // Small deltas are absorbed to bound event volume
                    if (task.progress - progress).abs() >= 1.0 {
                        task.progress = progress;
                        true
                    } else {
                        false
                    }
                }
                _ => return false,
            }
        };

        if changed {
            self.events
                .publish(CoreEvent::TaskProgress { task_id, progress });
        }
        true
    }

    async fn evict_terminal(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let count = {
            let mut state = self.state.lock().await;
            let before = state.tasks.len();
            state.tasks.retain(|_, task| {
                let expired = task.status.is_terminal()
                    && task
                        .completed_at
                        .and_then(|at| (now - at).to_std().ok())
                        .is_some_and(|age| age >= max_age);
                !expired
            });
            before - state.tasks.len()
        };

        if count > 0 {
            info!(count, "Evicted terminal tasks");
            self.events.publish(CoreEvent::TasksEvicted { count });
        }
        count
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }

        match shared.claim_next().await {
            Some(claimed) => shared.execute(claimed).await,
            None => {
                tokio::select! {
                    _ = shared.work_ready.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
    debug!(worker, "Worker stopped");
}

fn spawn_cleanup_task(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = shared.config.cleanup_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    shared.evict_terminal(shared.config.retention).await;
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    })
}

/// Runs submitted work on a fixed pool of worker loops, highest priority first.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Start the worker pool and the eviction job. Must be called inside a tokio runtime.
    pub fn new(config: SchedulerConfig, events: EventBus) -> Arc<Self> {
        let worker_count = config.workers.max(1);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(SchedulerState::default()),
            work_ready: Notify::new(),
            shutdown_tx,
            events,
        });

        let workers = (0..worker_count)
            .map(|i| tokio::spawn(worker_loop(Arc::clone(&shared), i)))
            .collect();
        let cleanup = spawn_cleanup_task(Arc::clone(&shared));

        info!(workers = worker_count, "Task scheduler started");
        shared
            .events
            .publish(CoreEvent::WorkersStarted { worker_count });

        Arc::new(Self {
            shared,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(workers),
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Enqueue a unit of work. Returns immediately with the task id.
    pub async fn submit<F, Fut>(&self, options: TaskOptions, work: F) -> Result<Uuid, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(TaskError::ShuttingDown);
        }

        let work: WorkFn = Box::new(move |ctx: TaskContext| -> TaskFuture { work(ctx).boxed() });
        let task = Task::new(options, work);
        let (id, name, priority) = (task.id, task.name.clone(), task.priority);

        {
            let mut state = self.shared.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueueEntry { priority, seq, id });
            state.tasks.insert(id, task);
        }

        debug!(task_id = %id, task = %name, priority, "Task submitted");
        self.shared.events.publish(CoreEvent::TaskSubmitted {
            task_id: id,
            name,
            priority,
        });
        self.shared.work_ready.notify_one();

        Ok(id)
    }

    /// Cancel a task that has not started. Running and finished tasks are untouched.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let cancelled = {
            let mut state = self.shared.state.lock().await;
            match state.tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    let _ = task.transition_to(TaskStatus::Cancelled);
                    task.work = None;
                    task.on_complete = None;
                    task.on_error = None;
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            info!(task_id = %task_id, "Task cancelled");
            self.shared
                .events
                .publish(CoreEvent::TaskCancelled { task_id });
        }
        cancelled
    }

    pub async fn get_status(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        self.shared
            .state
            .lock()
            .await
            .tasks
            .get(&task_id)
            .map(Task::snapshot)
    }

    /// Update a running task's progress. Returns `false` if the task is not running.
    pub async fn update_progress(&self, task_id: Uuid, progress: f64) -> bool {
        self.shared.update_progress(task_id, progress).await
    }

    pub async fn queue_stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock().await;
        let mut stats = SchedulerStats {
            total: state.tasks.len(),
            queue_size: state.queue.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Remove terminal tasks that finished at least `max_age` ago.
    pub async fn evict_terminal(&self, max_age: Duration) -> usize {
        self.shared.evict_terminal(max_age).await
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Stop accepting work, let workers finish their current unit, and clear
    /// remaining state. Waits at most `shutdown_timeout` for the workers.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared.shutdown_tx.send_replace(true);
        self.shared.work_ready.notify_waiters();

        if let Some(cleanup) = self.cleanup.lock().await.take() {
            cleanup.abort();
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let timeout = self.shared.config.shutdown_timeout;
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Workers did not stop in time, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
        }

        {
            let mut state = self.shared.state.lock().await;
            state.tasks.clear();
            state.queue.clear();
        }

        info!("Task scheduler shut down");
        self.shared.events.publish(CoreEvent::SchedulerShutdown);
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        // Workers and the eviction job exit on their own once signalled
        self.shared.shutdown_tx.send_replace(true);
    }
}
