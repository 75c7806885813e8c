//! Append-only change log with bounded retention.
//!
//! The log is an in-memory reference implementation: it offers no durability
//! across restarts. Retention evicts the oldest events by count and,
//! optionally, by age; readers asking for events that were already evicted
//! get an explicit `Compacted` error instead of a silently shortened stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use ctlplane_core::Entity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::ChangeEvent;

/// Source of change sequence numbers.
///
/// Numbers start at 1, are strictly increasing and never reused. Stores that
/// share a generator share one ordering.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// The generator shared by every store in this process.
    pub fn process() -> Arc<SequenceGenerator> {
        static PROCESS: OnceLock<Arc<SequenceGenerator>> = OnceLock::new();
        PROCESS.get_or_init(|| Arc::new(SequenceGenerator::new())).clone()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last number handed out (0 if none).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Bounds on how much history the log keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum number of retained events.
    pub max_events: usize,
    /// Events older than this (relative to the newest event) are evicted.
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_age: None,
        }
    }
}

impl RetentionPolicy {
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChangeLogError {
    /// Events after `requested` were evicted; the caller must resynchronise
    /// from the store itself.
    #[error("changes after sequence {requested} were compacted (oldest retained: {oldest_available:?})")]
    Compacted {
        requested: u64,
        oldest_available: Option<u64>,
    },
}

struct LogState<E: Entity> {
    events: VecDeque<ChangeEvent<E>>,
    /// Highest sequence number evicted so far.
    evicted_through: u64,
}

/// In-memory, sequence-ordered change log.
pub struct ChangeLog<E: Entity> {
    policy: RetentionPolicy,
    state: Mutex<LogState<E>>,
}

impl<E: Entity + Clone> ChangeLog<E> {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LogState {
                events: VecDeque::new(),
                evicted_through: 0,
            }),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Append an event. Callers append in sequence order.
    pub fn append(&self, event: ChangeEvent<E>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            state
                .events
                .back()
                .is_none_or(|last| last.sequence < event.sequence),
            "change log append out of order"
        );

        let newest = event.timestamp;
        state.events.push_back(event);

        while state.events.len() > self.policy.max_events {
            evict_front(&mut state);
        }

        if let Some(max_age) = self.policy.max_age {
            let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            while state
                .events
                .front()
                .is_some_and(|oldest| newest - oldest.timestamp > max_age)
            {
                evict_front(&mut state);
            }
        }
    }

    /// Retained events with `sequence > after`, oldest first.
    pub fn since(&self, after: u64) -> Result<Vec<ChangeEvent<E>>, ChangeLogError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if after < state.evicted_through {
            return Err(ChangeLogError::Compacted {
                requested: after,
                oldest_available: state.events.front().map(|e| e.sequence),
            });
        }

        Ok(state
            .events
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.events.back().map(|e| e.sequence)
    }
}

impl<E: Entity + Clone> Default for ChangeLog<E> {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

fn evict_front<E: Entity>(state: &mut LogState<E>) {
    if let Some(evicted) = state.events.pop_front() {
        state.evicted_through = evicted.sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
    }

    impl Entity for Item {
        type Id = String;

        fn id(&self) -> &String {
            &self.id
        }
    }

    fn item(id: &str) -> Item {
        Item { id: id.to_string() }
    }

    #[test]
    fn since_returns_events_after_sequence() {
        let log = ChangeLog::default();
        let ts = Utc::now();
        for seq in 1..=3 {
            log.append(ChangeEvent::created(item("a"), seq, ts));
        }

        let seqs: Vec<u64> = log.since(1).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(log.since(3).unwrap().is_empty());
        assert_eq!(log.latest_sequence(), Some(3));
    }

    #[test]
    fn count_retention_reports_compaction() {
        let log = ChangeLog::new(RetentionPolicy::default().with_max_events(2));
        let ts = Utc::now();
        for seq in 1..=4 {
            log.append(ChangeEvent::created(item("a"), seq, ts));
        }

        assert_eq!(log.len(), 2);
        assert!(matches!(
            log.since(1),
            Err(ChangeLogError::Compacted {
                requested: 1,
                oldest_available: Some(3)
            })
        ));
        let seqs: Vec<u64> = log.since(2).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn age_retention_evicts_old_events() {
        let log = ChangeLog::new(RetentionPolicy::default().with_max_age(Duration::from_secs(60)));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        log.append(ChangeEvent::created(item("a"), 1, t0));
        log.append(ChangeEvent::created(item("b"), 2, t0 + chrono::Duration::seconds(30)));
        log.append(ChangeEvent::created(item("c"), 3, t0 + chrono::Duration::seconds(90)));

        let seqs: Vec<u64> = log.since(1).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn process_generator_is_shared() {
        let a = SequenceGenerator::process();
        let b = SequenceGenerator::process();
        let first = a.next();
        let second = b.next();
        assert!(second > first);
    }

    proptest! {
        /// Property: interleaved draws from one generator are strictly increasing
        /// and gap-free.
        #[test]
        fn sequence_numbers_strictly_increase(draws in 1usize..200) {
            let generator = SequenceGenerator::new();
            let seqs: Vec<u64> = (0..draws).map(|_| generator.next()).collect();

            for pair in seqs.windows(2) {
                prop_assert_eq!(pair[1], pair[0] + 1);
            }
            prop_assert_eq!(generator.current(), draws as u64);
        }
    }
}
