//! Dispatcher: worker pool that claims due tasks and reconciles their outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use ctlplane_core::{Clock, QuerySpec, SortOrder, StoreError, SystemClock, panic_message};

use super::registry::{DispatchError, ExecutorRegistry};
use super::store::{Claim, LeaseId, TaskStore};
use super::types::{ExecutionResult, Task, TaskId, duration_millis, saturating_add};
use crate::config::DispatcherConfig;

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub exhausted: u64,
    pub unroutable: u64,
    pub reconcile_errors: u64,
}

impl DispatcherStats {
    fn record(&mut self, outcome: &TaskOutcome) {
        self.processed += 1;
        match outcome {
            TaskOutcome::Completed => self.succeeded += 1,
            TaskOutcome::Retried { .. } => self.retried += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Exhausted { .. } => self.exhausted += 1,
            TaskOutcome::Unroutable => self.unroutable += 1,
            TaskOutcome::ReconcileFailed(_) => self.reconcile_errors += 1,
        }
    }
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Executor succeeded; task deleted.
    Completed,
    /// Rescheduled for another attempt.
    Retried {
        attempt: u32,
        next_at: chrono::DateTime<chrono::Utc>,
    },
    /// Fatal failure; task deleted.
    Failed { reason: String },
    /// Retryable failure with no attempts left; task deleted.
    Exhausted { reason: String },
    /// No executor for the task type; task deleted.
    Unroutable,
    /// The store rejected the follow-up update or delete, e.g. because the
    /// lease expired and another claimer took the task over.
    ReconcileFailed(StoreError),
}

/// Result of one poll/claim/execute cycle.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(TaskId, TaskOutcome)>,
}

impl BatchReport {
    pub fn claimed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcome(&self, id: &TaskId) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(task_id, _)| task_id == id)
            .map(|(_, outcome)| outcome)
    }
}

/// Claims due tasks and routes them to their executors.
///
/// A dispatcher can be driven synchronously with [`Dispatcher::run_once`] or
/// spawned onto a pool of worker threads with [`Dispatcher::spawn`].
pub struct Dispatcher<S: TaskStore> {
    store: S,
    registry: ExecutorRegistry,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: TaskStore + 'static> Dispatcher<S> {
    pub fn new(store: S, registry: ExecutorRegistry, config: DispatcherConfig) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    /// Use `clock` for rescheduling instead of wall-clock time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The claim query: earliest due first, bounded by the batch size.
    pub fn claim_query(&self) -> QuerySpec {
        QuerySpec::none()
            .sort_by("at", SortOrder::Asc)
            .limit(self.config.batch_size.max(1))
    }

    /// Run one poll/claim/execute cycle on the calling thread.
    ///
    /// Only a failed claim is returned as an error; per-task failures are
    /// contained and reported in the batch.
    pub fn run_once(&self) -> Result<BatchReport, DispatchError> {
        let claims = self.store.fetch_for_update(&self.claim_query())?;
        let mut report = BatchReport::default();

        for claim in claims {
            let id = claim.task.id.clone();
            let outcome = self.process(claim);
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(&outcome);
            report.outcomes.push((id, outcome));
        }

        Ok(report)
    }

    fn process(&self, claim: Claim) -> TaskOutcome {
        let lease = claim.lease_id();
        let task = claim.into_task();
        let started = Instant::now();
        debug!(task_id = %task.id, task_type = %task.task_type, attempt = task.attempt, "executing task");

        let result = match self.registry.execute(&task) {
            Ok(result) => result,
            Err(e) => {
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %e,
                    "dropping task with no executor"
                );
                return self.remove(&task, lease, TaskOutcome::Unroutable);
            }
        };

        let elapsed_ms = duration_millis(started.elapsed());
        match result {
            ExecutionResult::Success => {
                debug!(task_id = %task.id, elapsed_ms, "task completed");
                self.remove(&task, lease, TaskOutcome::Completed)
            }
            ExecutionResult::FatalFailure(reason) => {
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempt = task.attempt,
                    error = %reason,
                    "task failed permanently"
                );
                self.remove(&task, lease, TaskOutcome::Failed { reason })
            }
            ExecutionResult::RetryableFailure(reason) => self.retry_or_exhaust(task, lease, reason),
        }
    }

    fn retry_or_exhaust(&self, mut task: Task, lease: LeaseId, reason: String) -> TaskOutcome {
        let policy = &self.config.retry;
        if !policy.should_retry(task.attempt) {
            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempts = task.attempt + 1,
                error = %reason,
                "task exhausted its retries"
            );
            return self.remove(&task, lease, TaskOutcome::Exhausted { reason });
        }

        let now = self.clock.now();
        let attempt = task.attempt + 1;
        let delay = policy.delay_for_attempt(attempt);
        task.attempt = attempt;
        task.at = saturating_add(now, delay);
        task.updated_at = now;

        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt,
            delay_ms = duration_millis(delay),
            error = %reason,
            "task failed; rescheduled"
        );

        match self.store.update(&task, Some(lease)) {
            Ok(()) => TaskOutcome::Retried {
                attempt,
                next_at: task.at,
            },
            Err(e) => reconcile_failed(&task, e, "failed to reschedule task"),
        }
    }

    fn remove(&self, task: &Task, lease: LeaseId, outcome: TaskOutcome) -> TaskOutcome {
        match self.store.delete(&task.id, Some(lease)) {
            Ok(()) => outcome,
            Err(e) => reconcile_failed(task, e, "failed to delete task"),
        }
    }

    /// Spawn `config.workers` worker threads sharing this dispatcher.
    pub fn spawn(self) -> std::io::Result<DispatcherHandle>
    where
        S: Send,
    {
        let stats = self.stats.clone();
        let name = self.config.name.clone();
        let shutdown_timeout = self.config.shutdown_timeout;
        let dispatcher = Arc::new(self);

        let mut workers = Vec::with_capacity(dispatcher.config.workers);
        for worker in 0..dispatcher.config.workers.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let dispatcher = dispatcher.clone();
            let join = thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || worker_loop(worker, &*dispatcher, &shutdown_rx))?;
            workers.push(Worker {
                shutdown: shutdown_tx,
                join,
            });
        }

        info!(dispatcher = %name, workers = workers.len(), "task dispatcher started");
        Ok(DispatcherHandle {
            name,
            workers,
            stats,
            shutdown_timeout,
        })
    }
}

fn reconcile_failed(task: &Task, e: StoreError, message: &str) -> TaskOutcome {
    if matches!(e, StoreError::LeaseLost(_)) {
        // Another claimer owns the task now; its outcome wins.
        warn!(task_id = %task.id, task_type = %task.task_type, error = %e, "{message}");
    } else {
        error!(task_id = %task.id, task_type = %task.task_type, error = %e, "{message}");
    }
    TaskOutcome::ReconcileFailed(e)
}

fn worker_loop<S: TaskStore + 'static>(
    worker: usize,
    dispatcher: &Dispatcher<S>,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    let name = &dispatcher.config.name;
    info!(dispatcher = %name, worker, "task worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let cycle = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.run_once()));
        let claimed = match cycle {
            Ok(Ok(report)) => {
                if !report.is_empty() {
                    debug!(dispatcher = %name, worker, claimed = report.claimed(), "batch processed");
                }
                report.claimed()
            }
            Ok(Err(e)) => {
                error!(dispatcher = %name, worker, error = %e, "failed to claim tasks");
                0
            }
            Err(panic) => {
                error!(
                    dispatcher = %name,
                    worker,
                    error = %panic_message(&*panic),
                    "dispatch cycle panicked"
                );
                0
            }
        };

        // Keep draining while there is work; wait out the poll interval otherwise.
        if claimed > 0 {
            continue;
        }
        match shutdown_rx.recv_timeout(dispatcher.config.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    info!(dispatcher = %name, worker, "task worker stopped");
}

#[derive(Debug)]
struct Worker {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    name: String,
    workers: Vec<Worker>,
    stats: Arc<Mutex<DispatcherStats>>,
    shutdown_timeout: Duration,
}

impl DispatcherHandle {
    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait up to the shutdown timeout for them to
    /// finish their current batch.
    ///
    /// Workers still running at the deadline are detached. Returns `true` if
    /// all workers stopped in time.
    pub fn shutdown(self) -> bool {
        for worker in &self.workers {
            let _ = worker.shutdown.send(());
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut stragglers = 0;
        for worker in self.workers {
            while !worker.join.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            if worker.join.is_finished() {
                if worker.join.join().is_err() {
                    warn!(dispatcher = %self.name, "task worker exited with a panic");
                }
            } else {
                stragglers += 1;
            }
        }

        if stragglers > 0 {
            warn!(
                dispatcher = %self.name,
                stragglers,
                timeout_ms = duration_millis(self.shutdown_timeout),
                "task workers did not stop in time; detaching"
            );
            return false;
        }

        info!(dispatcher = %self.name, "task dispatcher stopped");
        true
    }
}
