//! End-to-end task dispatch: store → dispatcher → executor → reconcile.
//!
//! Verifies:
//! - Successful tasks are removed
//! - Retryable failures are rescheduled into the future
//! - Concurrent claims never hand the same task to two callers
//! - Expired leases are reclaimed

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use ctlplane_core::{Clock, Criterion, ManualClock, QuerySpec};
use ctlplane_infra::config::{DispatcherConfig, TaskStoreConfig};
use ctlplane_infra::tasks::{
    Claim, DispatchError, Dispatcher, ExecutionResult, ExecutorRegistry, InMemoryTaskStore,
    RetryPolicy, Task, TaskId, TaskOutcome, TaskStore,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn store_with_clock() -> (Arc<ManualClock>, Arc<InMemoryTaskStore>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(InMemoryTaskStore::with_config(
        clock.clone(),
        TaskStoreConfig::default().with_lease_timeout(Duration::from_secs(60)),
    ));
    (clock, store)
}

#[test]
fn successful_task_is_removed() {
    ctlplane_observability::init();
    let (clock, store) = store_with_clock();
    store
        .create(Task::new_at("transfer-check", json!({}), t0()).with_id("t1"))
        .unwrap();

    let registry = ExecutorRegistry::builder()
        .register_fn("transfer-check", |_: &Value| Ok(ExecutionResult::Success))
        .unwrap()
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new(store.clone(), registry, DispatcherConfig::default())
        .with_clock(clock.clone());

    clock.set(t0() + chrono::Duration::seconds(1));
    let report = dispatcher.run_once().unwrap();

    assert_eq!(report.outcome(&TaskId::from("t1")), Some(&TaskOutcome::Completed));
    assert_eq!(store.find_by_id(&TaskId::from("t1")).unwrap(), None);
}

#[test]
fn retryable_failure_reschedules_into_the_future() {
    let (clock, store) = store_with_clock();
    store
        .create(Task::new_at("transfer-check", json!({}), t0()).with_id("t2"))
        .unwrap();

    let registry = ExecutorRegistry::builder()
        .register_fn("transfer-check", |_: &Value| {
            Ok(ExecutionResult::retryable("provider unavailable"))
        })
        .unwrap()
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new(store.clone(), registry, DispatcherConfig::default())
        .with_clock(clock.clone());

    dispatcher.run_once().unwrap();

    let task = store.find_by_id(&TaskId::from("t2")).unwrap().unwrap();
    assert_eq!(task.attempt, 1);
    assert!(task.at > clock.now());
}

#[test]
fn concurrent_claims_are_exclusive() {
    let (_, store) = store_with_clock();
    store
        .create(Task::new_at("transfer-check", json!({}), t0()).with_id("t3"))
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.fetch_for_update(&QuerySpec::none()).unwrap()
            })
        })
        .collect();

    let mut results: Vec<Vec<Claim>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|claimed| claimed.len());

    assert!(results[0].is_empty());
    assert_eq!(results[1].len(), 1);
    assert_eq!(results[1][0].task.id, TaskId::from("t3"));
}

#[test]
fn many_claimers_never_share_a_task() {
    let (_, store) = store_with_clock();
    for i in 0..200 {
        store
            .create(Task::new_at("bulk", json!({ "n": i }), t0()).with_id(format!("bulk-{i:03}")))
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let seen = seen.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let query = QuerySpec::none().limit(7);
                loop {
                    let claimed = store.fetch_for_update(&query).unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    seen.lock().unwrap().extend(claimed.into_iter().map(|c| c.task.id));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    let unique: HashSet<&TaskId> = seen.iter().collect();
    assert_eq!(seen.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[test]
fn abandoned_lease_is_reclaimed_after_timeout() {
    let (clock, store) = store_with_clock();
    store
        .create(Task::new_at("transfer-check", json!({}), t0()).with_id("orphan"))
        .unwrap();

    // A worker claims the task and dies without reconciling.
    assert_eq!(store.fetch_for_update(&QuerySpec::none()).unwrap().len(), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = {
        let calls = calls.clone();
        ExecutorRegistry::builder()
            .register_fn("transfer-check", move |_: &Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ExecutionResult::Success)
            })
            .unwrap()
            .build()
            .unwrap()
    };
    let dispatcher = Dispatcher::new(store.clone(), registry, DispatcherConfig::default())
        .with_clock(clock.clone());

    assert!(dispatcher.run_once().unwrap().is_empty());

    clock.advance(chrono::Duration::seconds(61));
    dispatcher.run_once().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.is_empty());
}

#[test]
fn late_worker_cannot_hand_back_a_reclaimed_task() {
    let (clock, store) = store_with_clock();
    store
        .create(Task::new_at("transfer-check", json!({}), t0()).with_id("contended"))
        .unwrap();

    let first = store.fetch_for_update(&QuerySpec::none()).unwrap().remove(0);
    clock.advance(chrono::Duration::seconds(61));
    let second = store.fetch_for_update(&QuerySpec::none()).unwrap().remove(0);

    let id = TaskId::from("contended");
    assert!(store.release(&id, first.lease_id()).is_err());
    assert!(store.fetch_for_update(&QuerySpec::none()).unwrap().is_empty());
    assert_eq!(store.leased_count(), 1);

    store.release(&id, second.lease_id()).unwrap();
    assert_eq!(store.fetch_for_update(&QuerySpec::none()).unwrap().len(), 1);
}

#[test]
fn retries_stop_at_max_attempts() {
    let (clock, store) = store_with_clock();
    store
        .create(Task::new_at("flaky", json!({}), t0()).with_id("t4"))
        .unwrap();

    let registry = ExecutorRegistry::builder()
        .register_fn("flaky", |_: &Value| Err(anyhow::anyhow!("timeout")))
        .unwrap()
        .build()
        .unwrap();
    let config = DispatcherConfig::default().with_retry(RetryPolicy::exponential(
        4,
        Duration::from_millis(100),
        Duration::from_secs(1),
    ));
    let dispatcher = Dispatcher::new(store.clone(), registry, config).with_clock(clock.clone());

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let report = dispatcher.run_once().unwrap();
        outcomes.extend(report.outcomes.into_iter().map(|(_, outcome)| outcome));
        clock.advance(chrono::Duration::seconds(2));
    }

    assert_eq!(outcomes.len(), 4);
    assert!(matches!(outcomes[0], TaskOutcome::Retried { attempt: 1, .. }));
    assert!(matches!(outcomes[2], TaskOutcome::Retried { attempt: 3, .. }));
    assert!(matches!(outcomes[3], TaskOutcome::Exhausted { .. }));
    assert!(store.is_empty());
    assert_eq!(dispatcher.stats().exhausted, 1);
}

#[test]
fn claim_query_filters_by_payload() {
    let (_, store) = store_with_clock();
    store
        .create(Task::new_at("x", json!({ "processId": "p-1" }), t0()).with_id("a"))
        .unwrap();
    store
        .create(Task::new_at("x", json!({ "processId": "p-2" }), t0()).with_id("b"))
        .unwrap();

    let query = QuerySpec::none().filter(Criterion::eq("payload.processId", "p-2"));
    let claimed = store.fetch_for_update(&query).unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task.id, TaskId::from("b"));
}

#[test]
fn duplicate_executor_fails_before_dispatch() {
    let result = ExecutorRegistry::builder()
        .register_fn("transfer-check", |_: &Value| Ok(ExecutionResult::Success))
        .and_then(|b| b.register_fn("transfer-check", |_: &Value| Ok(ExecutionResult::Success)));

    assert!(matches!(result, Err(DispatchError::DuplicateExecutor(_))));
}
