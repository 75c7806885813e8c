//! Core task types and retry policy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ctlplane_core::Queryable;
use ctlplane_core::query::json_path;

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh time-ordered id (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Task discriminator used to route a task to its executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Earliest instant at which the task may run.
    pub at: DateTime<Utc>,
    pub payload: Value,
    /// Failed attempts so far (0 on create).
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task that is due immediately.
    pub fn new(task_type: impl Into<TaskType>, payload: Value) -> Self {
        Self::new_at(task_type, payload, Utc::now())
    }

    /// Create a task stamped with `now` and due at `now`.
    pub fn new_at(task_type: impl Into<TaskType>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            at: now,
            payload,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Schedule the task for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.at <= now
    }

    /// Deserialize the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

impl Queryable for Task {
    fn field(&self, path: &str) -> Option<Value> {
        match path {
            "id" => Some(Value::from(self.id.as_str())),
            "type" | "taskType" => Some(Value::from(self.task_type.as_str())),
            "at" => Some(Value::from(self.at.timestamp_millis())),
            "attempt" => Some(Value::from(self.attempt)),
            "createdAt" => Some(Value::from(self.created_at.timestamp_millis())),
            "updatedAt" => Some(Value::from(self.updated_at.timestamp_millis())),
            "payload" => Some(self.payload.clone()),
            other => other
                .strip_prefix("payload.")
                .and_then(|rest| json_path(&self.payload, rest))
                .cloned(),
        }
    }
}

/// Standard payload of tasks produced from process state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTaskPayload {
    pub process_id: String,
    pub process_type: String,
    pub process_state: String,
}

/// Outcome reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Work done; the task is removed.
    Success,
    /// Transient failure; the task is rescheduled while attempts remain.
    RetryableFailure(String),
    /// Permanent failure; the task is removed.
    FatalFailure(String),
}

impl ExecutionResult {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy applied by the dispatcher to retryable failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first one.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

/// Floor applied to every computed delay so a rescheduled task is never due
/// at the instant it failed.
const MIN_DELAY: Duration = Duration::from_millis(1);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Never below 1 ms, never above `max_delay` (unless `max_delay` is below
    /// the floor), and non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = duration_millis(self.base_delay);
        let max_ms = duration_millis(self.max_delay);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
        };

        Duration::from_millis(delay_ms.min(max_ms)).max(MIN_DELAY)
    }

    /// Whether a task that has failed `attempt` times before the current
    /// failure may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

/// `instant + duration`, clamped to the latest representable instant.
pub fn saturating_add(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
