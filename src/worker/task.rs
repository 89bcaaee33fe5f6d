//! Task records, submission options and status snapshots.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::context::TaskContext;
use super::state::{TaskPriority, TaskStatus};

/// Future produced by a unit of work.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;

pub(crate) type WorkFn = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;

/// Invoked with the task result after successful completion.
pub type CompleteCallback = Box<dyn FnOnce(Value) + Send>;

/// Invoked with the rendered error message after a failure.
pub type ErrorCallback = Box<dyn FnOnce(String) + Send>;

/// Options for a submitted task.
pub struct TaskOptions {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) priority: i32,
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: TaskPriority::NORMAL,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(Value) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::new("task")
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub priority: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task owned by the scheduler from submission to eviction.
pub(crate) struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub priority: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub work: Option<WorkFn>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Task {
    pub fn new(options: TaskOptions, work: WorkFn) -> Self {
        let description = options
            .description
            .unwrap_or_else(|| format!("Task {}", options.name));
        Self {
            id: Uuid::new_v4(),
            name: options.name,
            description,
            status: TaskStatus::Pending,
            progress: 0.0,
            priority: options.priority,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            work: Some(work),
            on_complete: options.on_complete,
            on_error: options.on_error,
        }
    }

    /// Move to `status`, stamping start/completion times.
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(status) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, status
            ));
        }

        self.status = status;
        match status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            status: self.status,
            progress: self.progress,
            priority: self.priority,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Priority heap entry: highest priority first, then earliest submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: i32,
    pub seq: u64,
    pub id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use futures::FutureExt;

    use super::*;

    fn noop_work() -> WorkFn {
        Box::new(|_ctx: TaskContext| -> TaskFuture { async { Ok(Value::Null) }.boxed() })
    }

    #[test]
    fn heap_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        heap.push(QueueEntry { priority: 1, seq: 0, id: ids[0] });
        heap.push(QueueEntry { priority: 3, seq: 1, id: ids[1] });
        heap.push(QueueEntry { priority: 1, seq: 2, id: ids[2] });
        heap.push(QueueEntry { priority: 3, seq: 3, id: ids[3] });

        let order: Vec<Uuid> = std::iter::from_fn(|| heap.pop().map(|e| e.id)).collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2]]);
    }

    #[test]
    fn default_description_uses_name() {
        let task = Task::new(TaskOptions::new("search"), noop_work());
        assert_eq!(task.description, "Task search");
        assert_eq!(task.priority, TaskPriority::NORMAL);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn transitions_stamp_timestamps() {
        let mut task = Task::new(TaskOptions::new("save"), noop_work());
        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.transition_to(TaskStatus::Running).is_err());
    }
}
