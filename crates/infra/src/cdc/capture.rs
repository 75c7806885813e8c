//! Change-capturing store wrapper.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use ctlplane_core::{Clock, Entity, QuerySpec, Queryable, StoreResult, SystemClock};
use ctlplane_events::{
    ChangeEvent, ChangeLog, ChangeLogError, ChangeListener, ChangeRegistry, ListenerId,
    ListenerSet, RetentionPolicy, SequenceGenerator,
};

use super::entity_store::{EntityStore, InMemoryEntityStore};

/// Mutation outcome waiting for its sequence number.
enum Change<E> {
    Created(E),
    Updated { previous: E, current: E },
    Deleted(E),
}

impl<E: Entity> Change<E> {
    fn into_event(self, sequence: u64, timestamp: chrono::DateTime<chrono::Utc>) -> ChangeEvent<E> {
        match self {
            Change::Created(entity) => ChangeEvent::created(entity, sequence, timestamp),
            Change::Updated { previous, current } => {
                ChangeEvent::updated(previous, current, sequence, timestamp)
            }
            Change::Deleted(previous) => ChangeEvent::deleted(previous, sequence, timestamp),
        }
    }
}

/// Wraps an entity store and emits a sequenced `ChangeEvent` for every
/// successful mutation.
///
/// The mutation, sequence assignment, log append and listener snapshot happen
/// under one commit lock. The delivery lock is taken before the commit lock is
/// released, so listeners see events in commit order. Listeners run on the
/// mutating thread and must not mutate this same store.
///
/// ## Usage Pattern
///
/// ```ignore
/// let store = ChangeCaptureStore::new(InMemoryEntityStore::new());
/// store.register_listener(Arc::new(producer));
/// store.update(process)?;   // producer sees the change before this returns
/// ```
pub struct ChangeCaptureStore<S, E>
where
    E: Entity,
{
    base: S,
    clock: Arc<dyn Clock>,
    sequence: Arc<SequenceGenerator>,
    log: ChangeLog<E>,
    listeners: ListenerSet<E>,
    commit: Mutex<()>,
    delivery: Mutex<()>,
}

impl<E> ChangeCaptureStore<InMemoryEntityStore<E>, E>
where
    E: Entity + Queryable + Clone + Send + Sync,
    E::Id: Send + Sync,
{
    /// Change capture over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(InMemoryEntityStore::new())
    }
}

impl<S, E> ChangeCaptureStore<S, E>
where
    S: EntityStore<E>,
    E: Entity + Queryable + Clone,
{
    /// Wrap `base` using the process-wide sequence and default retention.
    pub fn new(base: S) -> Self {
        Self {
            base,
            clock: Arc::new(SystemClock),
            sequence: SequenceGenerator::process(),
            log: ChangeLog::default(),
            listeners: ListenerSet::new(),
            commit: Mutex::new(()),
            delivery: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Draw sequence numbers from `sequence` instead of the process-wide one.
    pub fn with_sequence(mut self, sequence: Arc<SequenceGenerator>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.log = ChangeLog::new(policy);
        self
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Retained events with `sequence > after`, oldest first.
    pub fn changes_since(&self, after: u64) -> Result<Vec<ChangeEvent<E>>, ChangeLogError> {
        self.log.since(after)
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.log.latest_sequence()
    }

    fn capture<T>(
        &self,
        mutate: impl FnOnce(&S) -> StoreResult<(T, Change<E>)>,
    ) -> StoreResult<T> {
        let commit = self.commit.lock().unwrap_or_else(PoisonError::into_inner);
        let (result, change) = mutate(&self.base)?;

        let event = change.into_event(self.sequence.next(), self.clock.now());
        self.log.append(event.clone());
        let listeners = self.listeners.snapshot();

        let delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        drop(commit);

        trace!(
            entity_id = %event.entity_id,
            change_type = %event.change_type,
            sequence = event.sequence,
            listeners = listeners.len(),
            "delivering change"
        );
        ListenerSet::deliver(&listeners, &event);
        drop(delivery);

        Ok(result)
    }
}

impl<S, E> EntityStore<E> for ChangeCaptureStore<S, E>
where
    S: EntityStore<E>,
    E: Entity + Queryable + Clone + Send + Sync,
    E::Id: Send + Sync,
{
    fn create(&self, entity: E) -> StoreResult<()> {
        self.capture(|base| {
            base.create(entity.clone())?;
            Ok(((), Change::Created(entity)))
        })
    }

    fn update(&self, entity: E) -> StoreResult<E> {
        self.capture(|base| {
            let previous = base.update(entity.clone())?;
            Ok((
                previous.clone(),
                Change::Updated {
                    previous,
                    current: entity,
                },
            ))
        })
    }

    fn save(&self, entity: E) -> StoreResult<Option<E>> {
        self.capture(|base| {
            let previous = base.save(entity.clone())?;
            let change = match previous.clone() {
                Some(previous) => Change::Updated {
                    previous,
                    current: entity,
                },
                None => Change::Created(entity),
            };
            Ok((previous, change))
        })
    }

    fn delete(&self, id: &E::Id) -> StoreResult<E> {
        self.capture(|base| {
            let removed = base.delete(id)?;
            Ok((removed.clone(), Change::Deleted(removed)))
        })
    }

    fn find_by_id(&self, id: &E::Id) -> StoreResult<Option<E>> {
        self.base.find_by_id(id)
    }

    fn query(&self, query: &QuerySpec) -> StoreResult<Vec<E>> {
        self.base.query(query)
    }
}

impl<S, E> ChangeRegistry<E> for ChangeCaptureStore<S, E>
where
    S: EntityStore<E>,
    E: Entity + Queryable + Clone,
{
    fn register_listener(&self, listener: Arc<dyn ChangeListener<E>>) -> ListenerId {
        // Serialized with commits: only commits that start after this returns
        // are delivered to the new listener.
        let _commit = self.commit.lock().unwrap_or_else(PoisonError::into_inner);
        self.listeners.register(listener)
    }

    fn deregister_listener(&self, id: ListenerId) -> bool {
        let _commit = self.commit.lock().unwrap_or_else(PoisonError::into_inner);
        self.listeners.deregister(id)
    }
}
