//! Task storage implementations.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use ctlplane_core::{Clock, QuerySpec, StoreError, StoreResult, SystemClock};

use super::types::{Task, TaskId, saturating_add};
use crate::config::TaskStoreConfig;

/// Batch bound applied when a claim query carries no limit.
pub const DEFAULT_BATCH_LIMIT: usize = 50;

/// Task store abstraction.
///
/// `fetch_for_update` is the only way a dispatcher obtains work: it claims
/// due tasks atomically, so no task is ever held by two workers at once.
///
/// Follow-up writes are fenced by lease. Passing the lease from a [`Claim`]
/// succeeds only while that lease is still the task's current one. Passing
/// `None` succeeds only while nobody holds an active lease on the task.
/// Either way a rejected write fails with `LeaseLost`.
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `DuplicateKey` if the id is taken.
    fn create(&self, task: Task) -> StoreResult<()>;

    /// Claim up to `limit` due, unleased tasks matching `query`.
    ///
    /// Due means `at <= now`. Ordering follows the query's sort, otherwise
    /// earliest `at` first.
    fn fetch_for_update(&self, query: &QuerySpec) -> StoreResult<Vec<Claim>>;

    /// Overwrite a task by id and release its lease.
    fn update(&self, task: &Task, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Remove a task (and its lease).
    fn delete(&self, id: &TaskId, lease: Option<LeaseId>) -> StoreResult<()>;

    fn find_by_id(&self, id: &TaskId) -> StoreResult<Option<Task>>;

    /// Hand a claimed task back without touching it.
    fn release(&self, id: &TaskId, lease: LeaseId) -> StoreResult<()>;
}

/// Fencing token identifying one claim on one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Claim held on a task by one `fetch_for_update` caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A task handed out by `fetch_for_update`, with the lease that fences it.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub task: Task,
    pub lease: Lease,
}

impl Claim {
    pub fn lease_id(&self) -> LeaseId {
        self.lease.lease_id
    }

    pub fn into_task(self) -> Task {
        self.task
    }
}

#[derive(Debug, Clone)]
struct Entry {
    task: Task,
    lease: Option<Lease>,
}

impl Entry {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.task.is_due(now) && !self.lease.is_some_and(|lease| lease.is_active(now))
    }

    fn check_lease(&self, lease: Option<LeaseId>, now: DateTime<Utc>) -> StoreResult<()> {
        match (lease, self.lease) {
            (Some(mine), Some(current)) if current.lease_id == mine => Ok(()),
            (Some(_), _) => Err(StoreError::lease_lost(&self.task.id)),
            (None, Some(current)) if current.is_active(now) => {
                Err(StoreError::lease_lost(&self.task.id))
            }
            (None, _) => Ok(()),
        }
    }
}

/// In-memory task store with lease-based claims.
///
/// One coarse `RwLock` guards the map; `fetch_for_update` holds the write
/// guard for its whole scan-and-mark step.
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, TaskStoreConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: TaskStoreConfig) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            clock,
            lease_timeout: config.lease_timeout,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks currently held under an unexpired lease.
    pub fn leased_count(&self) -> usize {
        let now = self.clock.now();
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.lease.is_some_and(|lease| lease.is_active(now)))
            .count()
    }

    pub fn lease_of(&self, id: &TaskId) -> StoreResult<Option<Lease>> {
        let tasks = self.tasks.read().map_err(StoreError::lock_poisoned)?;
        Ok(tasks.get(id).and_then(|e| e.lease))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, mut task: Task) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(StoreError::lock_poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::duplicate_key(&task.id));
        }

        task.attempt = 0;
        tasks.insert(task.id.clone(), Entry { task, lease: None });
        Ok(())
    }

    fn fetch_for_update(&self, query: &QuerySpec) -> StoreResult<Vec<Claim>> {
        let mut tasks = self.tasks.write().map_err(StoreError::lock_poisoned)?;
        let now = self.clock.now();

        let mut candidates: Vec<&Entry> = tasks
            .values()
            .filter(|e| e.is_claimable(now) && query.matches(&e.task))
            .collect();

        candidates.sort_by(|a, b| {
            let ordering = if query.sort_field.is_some() {
                query.compare(&a.task, &b.task)
            } else {
                Ordering::Equal
            };
            ordering
                .then_with(|| a.task.at.cmp(&b.task.at))
                .then_with(|| a.task.id.cmp(&b.task.id))
        });

        let limit = query.limit.unwrap_or(DEFAULT_BATCH_LIMIT);
        let selected: Vec<TaskId> = candidates
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|e| e.task.id.clone())
            .collect();

        let expires_at = saturating_add(now, self.lease_timeout);
        let mut claimed = Vec::with_capacity(selected.len());
        for id in selected {
            let Some(entry) = tasks.get_mut(&id) else {
                continue;
            };
            if let Some(expired) = entry.lease {
                warn!(
                    task_id = %id,
                    task_type = %entry.task.task_type,
                    lease_id = %expired.lease_id,
                    leased_at = %expired.leased_at,
                    "reclaiming task with expired lease"
                );
            }
            let lease = Lease {
                lease_id: LeaseId::generate(),
                leased_at: now,
                expires_at,
            };
            entry.lease = Some(lease);
            claimed.push(Claim {
                task: entry.task.clone(),
                lease,
            });
        }

        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), expires_at = %expires_at, "claimed tasks");
        }
        Ok(claimed)
    }

    fn update(&self, task: &Task, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(StoreError::lock_poisoned)?;
        let entry = tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found(&task.id))?;
        entry.check_lease(lease, self.clock.now())?;

        entry.task = task.clone();
        entry.lease = None;
        Ok(())
    }

    fn delete(&self, id: &TaskId, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(StoreError::lock_poisoned)?;
        let entry = tasks.get(id).ok_or_else(|| StoreError::not_found(id))?;
        entry.check_lease(lease, self.clock.now())?;

        tasks.remove(id);
        Ok(())
    }

    fn find_by_id(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        let tasks = self.tasks.read().map_err(StoreError::lock_poisoned)?;
        Ok(tasks.get(id).map(|e| e.task.clone()))
    }

    fn release(&self, id: &TaskId, lease: LeaseId) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(StoreError::lock_poisoned)?;
        let entry = tasks.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;
        entry.check_lease(Some(lease), self.clock.now())?;

        entry.lease = None;
        Ok(())
    }
}

impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn create(&self, task: Task) -> StoreResult<()> {
        (**self).create(task)
    }

    fn fetch_for_update(&self, query: &QuerySpec) -> StoreResult<Vec<Claim>> {
        (**self).fetch_for_update(query)
    }

    fn update(&self, task: &Task, lease: Option<LeaseId>) -> StoreResult<()> {
        (**self).update(task, lease)
    }

    fn delete(&self, id: &TaskId, lease: Option<LeaseId>) -> StoreResult<()> {
        (**self).delete(id, lease)
    }

    fn find_by_id(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        (**self).find_by_id(id)
    }

    fn release(&self, id: &TaskId, lease: LeaseId) -> StoreResult<()> {
        (**self).release(id, lease)
    }
}
