//! Synchronous change listeners.
//!
//! Listeners run on the mutating caller's thread, so they must stay cheap.
//! Non-trivial follow-up work belongs in a task enqueued by the listener.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ctlplane_core::{Entity, panic_message};
use thiserror::Error;
use tracing::warn;

use crate::change::ChangeEvent;

/// Failure reported by (or caught around) a listener.
///
/// Never affects the outcome of the mutation that triggered it.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(#[from] anyhow::Error),

    #[error("listener panicked: {0}")]
    Panicked(String),
}

/// Callback invoked with every committed change.
pub trait ChangeListener<E: Entity>: Send + Sync {
    fn on_change(&self, event: &ChangeEvent<E>) -> Result<(), ListenerError>;
}

impl<E, F> ChangeListener<E> for F
where
    E: Entity,
    F: Fn(&ChangeEvent<E>) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent<E>) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Handle of one registration.
///
/// Registrations are not keyed by listener identity: registering the same
/// listener twice yields two ids and two deliveries per event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Registration surface of a change-capturing store.
pub trait ChangeRegistry<E: Entity> {
    fn register_listener(&self, listener: Arc<dyn ChangeListener<E>>) -> ListenerId;

    /// Returns `false` if the id was not registered.
    fn deregister_listener(&self, id: ListenerId) -> bool;
}

/// Ordered set of registered listeners.
pub struct ListenerSet<E: Entity> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener<E>>)>>,
}

impl<E: Entity> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Arc<dyn ChangeListener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners registered right now, in registration order.
    pub fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn ChangeListener<E>>)> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver `event` to each listener of `snapshot` in order.
    ///
    /// A failing or panicking listener is logged and skipped; the remaining
    /// listeners still receive the event. Returns the number of failures.
    pub fn deliver(
        snapshot: &[(ListenerId, Arc<dyn ChangeListener<E>>)],
        event: &ChangeEvent<E>,
    ) -> usize {
        let mut failures = 0;
        for (id, listener) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(event)))
                .unwrap_or_else(|panic| Err(ListenerError::Panicked(panic_message(&*panic))));

            if let Err(err) = outcome {
                failures += 1;
                warn!(
                    listener = id.value(),
                    entity_id = %event.entity_id,
                    change_type = %event.change_type,
                    sequence = event.sequence,
                    error = %err,
                    "change listener failed"
                );
            }
        }
        failures
    }
}

impl<E: Entity> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;

    #[derive(Debug, Clone)]
    struct Item {
        id: String,
    }

    impl Entity for Item {
        type Id = String;

        fn id(&self) -> &String {
            &self.id
        }
    }

    fn event(sequence: u64) -> ChangeEvent<Item> {
        ChangeEvent::created(Item { id: "item-1".into() }, sequence, Utc::now())
    }

    #[test]
    fn delivers_in_registration_order_including_duplicates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::<Item>::new();

        for tag in ["first", "second"] {
            let seen = seen.clone();
            set.register(Arc::new(move |e: &ChangeEvent<Item>| -> Result<(), ListenerError> {
                seen.lock().unwrap().push((tag, e.sequence));
                Ok(())
            }));
        }
        let dup: Arc<dyn ChangeListener<Item>> = {
            let seen = seen.clone();
            Arc::new(move |e: &ChangeEvent<Item>| -> Result<(), ListenerError> {
                seen.lock().unwrap().push(("dup", e.sequence));
                Ok(())
            })
        };
        set.register(dup.clone());
        set.register(dup);

        let failures = ListenerSet::deliver(&set.snapshot(), &event(7));

        assert_eq!(failures, 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("dup", 7), ("dup", 7)]
        );
    }

    #[test]
    fn failing_and_panicking_listeners_do_not_stop_delivery() {
        let delivered = Arc::new(Mutex::new(0));
        let set = ListenerSet::<Item>::new();

        set.register(Arc::new(|_: &ChangeEvent<Item>| -> Result<(), ListenerError> {
            Err(anyhow::anyhow!("boom").into())
        }));
        set.register(Arc::new(|_: &ChangeEvent<Item>| -> Result<(), ListenerError> {
            panic!("listener exploded")
        }));
        {
            let delivered = delivered.clone();
            set.register(Arc::new(move |_: &ChangeEvent<Item>| -> Result<(), ListenerError> {
                *delivered.lock().unwrap() += 1;
                Ok(())
            }));
        }

        let failures = ListenerSet::deliver(&set.snapshot(), &event(1));

        assert_eq!(failures, 2);
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[test]
    fn deregister_removes_only_that_registration() {
        let set = ListenerSet::<Item>::new();
        let listener: Arc<dyn ChangeListener<Item>> =
            Arc::new(|_: &ChangeEvent<Item>| -> Result<(), ListenerError> { Ok(()) });

        let a = set.register(listener.clone());
        let b = set.register(listener);

        assert!(set.deregister(a));
        assert!(!set.deregister(a));
        assert_eq!(set.len(), 1);
        assert_eq!(set.snapshot()[0].0, b);
    }
}
