//! Task state machine.

use serde::{Deserialize, Serialize};

/// State of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued and waiting for a worker.
    Pending,
    /// A worker is executing the task.
    Running,
    /// Task finished with a result.
    Completed,
    /// Task returned an error or panicked.
    Failed,
    /// Task was cancelled before it started.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Named priority levels. Any `i32` is a valid priority; higher runs first.
pub struct TaskPriority;

impl TaskPriority {
    pub const LOW: i32 = 0;
    pub const NORMAL: i32 = 1;
    pub const HIGH: i32 = 2;
    pub const CRITICAL: i32 = 3;
}
