//! Worker system — prioritized background tasks on a fixed worker pool.
//!
//! Core components:
//! - `task` — Task records, submission options, snapshots
//! - `state` — Task state machine (Pending → Running → Completed/Failed, Pending → Cancelled)
//! - `context` — Handle passed to running work for progress reporting
//! - `scheduler` — Worker pool, priority heap, eviction of finished tasks

pub mod context;
pub mod scheduler;
pub mod state;
pub mod task;

pub use context::TaskContext;
pub use scheduler::{SchedulerStats, TaskScheduler};
pub use state::{TaskPriority, TaskStatus};
pub use task::{TaskFuture, TaskOptions, TaskSnapshot};
