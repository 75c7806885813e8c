//! Configuration loading and representation.
//!
//! Every config struct has a `Default`, `with_*` builders, and a `from_env()`
//! loader. Loaders read through a lookup function so they can be exercised
//! without touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use ctlplane_events::RetentionPolicy;
use thiserror::Error;

use crate::tasks::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

pub const TASKS_WORKERS: &str = "CTLPLANE_TASKS_WORKERS";
pub const TASKS_POLL_INTERVAL_MS: &str = "CTLPLANE_TASKS_POLL_INTERVAL_MS";
pub const TASKS_BATCH_SIZE: &str = "CTLPLANE_TASKS_BATCH_SIZE";
pub const TASKS_MAX_ATTEMPTS: &str = "CTLPLANE_TASKS_MAX_ATTEMPTS";
pub const TASKS_SHUTDOWN_TIMEOUT_SECS: &str = "CTLPLANE_TASKS_SHUTDOWN_TIMEOUT_SECS";
pub const TASKS_BACKOFF_BASE_MS: &str = "CTLPLANE_TASKS_BACKOFF_BASE_MS";
pub const TASKS_BACKOFF_MAX_MS: &str = "CTLPLANE_TASKS_BACKOFF_MAX_MS";
pub const TASKS_LEASE_TIMEOUT_SECS: &str = "CTLPLANE_TASKS_LEASE_TIMEOUT_SECS";
pub const CDC_RETENTION_MAX_EVENTS: &str = "CTLPLANE_CDC_RETENTION_MAX_EVENTS";
pub const CDC_RETENTION_MAX_AGE_SECS: &str = "CTLPLANE_CDC_RETENTION_MAX_AGE_SECS";

/// Dispatcher worker-pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Prefix for worker thread names.
    pub name: String,
    /// Number of worker threads.
    pub workers: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// How long `shutdown` waits for workers to finish their current batch.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "task-dispatcher".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(100),
            batch_size: 1,
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = parse(&lookup, TASKS_WORKERS)? {
            config.workers = workers;
        }
        if let Some(ms) = parse(&lookup, TASKS_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(batch_size) = parse(&lookup, TASKS_BATCH_SIZE)? {
            config.batch_size = batch_size;
        }
        if let Some(max_attempts) = parse(&lookup, TASKS_MAX_ATTEMPTS)? {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(secs) = parse(&lookup, TASKS_SHUTDOWN_TIMEOUT_SECS)? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, TASKS_BACKOFF_BASE_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, TASKS_BACKOFF_MAX_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Task store configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStoreConfig {
    /// A claim not released within this window is considered abandoned.
    pub lease_timeout: Duration,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
        }
    }
}

impl TaskStoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = parse(&lookup, TASKS_LEASE_TIMEOUT_SECS)? {
            config.lease_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }
}

/// Change-log retention from `CTLPLANE_CDC_RETENTION_*`.
pub fn retention_from_env() -> Result<RetentionPolicy, ConfigError> {
    retention_from_lookup(|key| std::env::var(key).ok())
}

pub fn retention_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RetentionPolicy, ConfigError> {
    let mut policy = RetentionPolicy::default();
    if let Some(max_events) = parse(&lookup, CDC_RETENTION_MAX_EVENTS)? {
        policy = policy.with_max_events(max_events);
    }
    if let Some(secs) = parse(&lookup, CDC_RETENTION_MAX_AGE_SECS)? {
        policy = policy.with_max_age(Duration::from_secs(secs));
    }
    Ok(policy)
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}
