//! Execution context handed to each unit of work.

use std::sync::Arc;

use uuid::Uuid;

use super::scheduler::Shared;

/// Handle a running task uses to identify itself and report progress.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    shared: Arc<Shared>,
}

impl TaskContext {
    pub(crate) fn new(task_id: Uuid, shared: Arc<Shared>) -> Self {
        Self { task_id, shared }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Report progress in percent. Values are clamped to 0–100.
    ///
    /// Returns `false` if the task is no longer running.
    pub async fn report_progress(&self, progress: f64) -> bool {
        self.shared.update_progress(self.task_id, progress).await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .finish()
    }
}
