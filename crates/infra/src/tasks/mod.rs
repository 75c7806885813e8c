//! Deferred task system: storage with atomic claims, executor routing, and
//! the dispatcher worker pool.
//!
//! ## Design
//!
//! - A task is claimed by at most one worker at a time (lease on claim)
//! - Abandoned leases expire and the task becomes claimable again
//! - Executors run outside the store's claim lock
//! - Retryable failures are rescheduled with bounded backoff; fatal,
//!   exhausted and unroutable tasks are dropped with an error log
//!
//! ## Components
//!
//! - `Task`: unit of work with type, due time and JSON payload
//! - `TaskStore`: persistence with `fetch_for_update` claims; follow-up
//!   writes are fenced by the claim's lease
//! - `TaskService`: store front door that notifies creation listeners
//! - `ExecutorRegistry`: one executor per task type, validated at startup
//! - `Dispatcher`: polls, executes and reconciles on worker threads

pub mod dispatcher;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use dispatcher::{BatchReport, Dispatcher, DispatcherHandle, DispatcherStats, TaskOutcome};
pub use registry::{DispatchError, ExecutorRegistry, ExecutorRegistryBuilder, TaskExecutor};
pub use service::{TaskListener, TaskService};
pub use store::{Claim, DEFAULT_BATCH_LIMIT, InMemoryTaskStore, Lease, LeaseId, TaskStore};
pub use types::{
    BackoffStrategy, ExecutionResult, ProcessTaskPayload, RetryPolicy, Task, TaskId, TaskType,
};
