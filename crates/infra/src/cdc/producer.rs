//! Turns process state transitions into tasks.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use ctlplane_core::{Clock, Entity, SystemClock};
use ctlplane_events::{ChangeEvent, ChangeListener, ListenerError};

use crate::tasks::{ProcessTaskPayload, Task, TaskService, TaskType};

/// An entity driven by a state machine.
pub trait ProcessEntity: Entity {
    fn state(&self) -> &str;

    /// Process kind written into produced payloads (e.g. `transfer`).
    fn process_type(&self) -> &str;
}

/// Change listener that enqueues a task whenever a process enters a state
/// with a route.
///
/// A change counts as a transition when the entity was created or its state
/// differs from the previous snapshot. Deletions and unrouted states produce
/// nothing.
pub struct StateChangeTaskProducer<E> {
    service: Arc<TaskService>,
    clock: Arc<dyn Clock>,
    routes: HashMap<String, TaskType>,
    _entity: PhantomData<fn(&E)>,
}

impl<E: ProcessEntity> StateChangeTaskProducer<E> {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self {
            service,
            clock: Arc::new(SystemClock),
            routes: HashMap::new(),
            _entity: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Route entries into `state` to tasks of `task_type`.
    pub fn route(mut self, state: impl Into<String>, task_type: impl Into<TaskType>) -> Self {
        self.routes.insert(state.into(), task_type.into());
        self
    }

    pub fn task_type_for(&self, state: &str) -> Option<&TaskType> {
        self.routes.get(state)
    }

    fn transition<'a>(event: &'a ChangeEvent<E>) -> Option<&'a E> {
        let current = event.snapshot.as_ref()?;
        match &event.previous {
            Some(previous) if previous.state() == current.state() => None,
            _ => Some(current),
        }
    }
}

impl<E> ChangeListener<E> for StateChangeTaskProducer<E>
where
    E: ProcessEntity,
{
    fn on_change(&self, event: &ChangeEvent<E>) -> Result<(), ListenerError> {
        let Some(entity) = Self::transition(event) else {
            return Ok(());
        };
        let Some(task_type) = self.routes.get(entity.state()) else {
            return Ok(());
        };

        let payload = ProcessTaskPayload {
            process_id: entity.id().to_string(),
            process_type: entity.process_type().to_string(),
            process_state: entity.state().to_string(),
        };
        let payload = serde_json::to_value(&payload).map_err(anyhow::Error::from)?;

        let task = Task::new_at(task_type.clone(), payload, self.clock.now());
        let task_id = self.service.create(task).map_err(anyhow::Error::from)?;

        debug!(
            task_id = %task_id,
            task_type = %task_type,
            process_id = %entity.id(),
            process_state = entity.state(),
            sequence = event.sequence,
            "enqueued task for state change"
        );
        Ok(())
    }
}
