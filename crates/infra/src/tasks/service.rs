//! Task service: the store plus creation notifications.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use ctlplane_core::{QuerySpec, StoreResult};

use super::store::{Claim, TaskStore};
use super::types::{Task, TaskId};

/// Observer of task creation.
pub trait TaskListener: Send + Sync {
    fn created(&self, task: &Task) -> anyhow::Result<()>;
}

impl<F> TaskListener for F
where
    F: Fn(&Task) -> anyhow::Result<()> + Send + Sync,
{
    fn created(&self, task: &Task) -> anyhow::Result<()> {
        self(task)
    }
}

/// Front door for components that enqueue work.
///
/// Listeners are told about a task only after the store accepted it; a failing
/// listener is logged and does not undo the create.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn register_listener(&self, listener: Arc<dyn TaskListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn create(&self, task: Task) -> StoreResult<TaskId> {
        let id = task.id.clone();
        self.store.create(task.clone())?;
        debug!(task_id = %id, task_type = %task.task_type, at = %task.at, "task created");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(e) = listener.created(&task) {
                warn!(task_id = %id, error = %e, "task listener failed");
            }
        }

        Ok(id)
    }

    /// Claim due tasks; see [`TaskStore::fetch_for_update`].
    pub fn fetch_latest(&self, query: &QuerySpec) -> StoreResult<Vec<Claim>> {
        self.store.fetch_for_update(query)
    }

    /// Overwrite a task nobody is working on; see [`TaskStore::update`].
    pub fn update(&self, task: &Task) -> StoreResult<()> {
        self.store.update(task, None)
    }

    /// Remove a task nobody is working on; see [`TaskStore::delete`].
    pub fn delete(&self, id: &TaskId) -> StoreResult<()> {
        self.store.delete(id, None)
    }

    pub fn find_by_id(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        self.store.find_by_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use ctlplane_core::StoreError;
    use serde_json::json;

    use crate::tasks::InMemoryTaskStore;

    #[test]
    fn notifies_listeners_after_create() {
        let service = TaskService::new(Arc::new(InMemoryTaskStore::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            service.register_listener(Arc::new(move |task: &Task| -> anyhow::Result<()> {
                seen.lock().unwrap().push(task.id.clone());
                Ok(())
            }));
        }

        let id = service
            .create(Task::new("transfer-check", json!({})).with_id("t1"))
            .unwrap();

        assert_eq!(id, TaskId::from("t1"));
        assert_eq!(*seen.lock().unwrap(), vec![TaskId::from("t1")]);
        assert!(service.find_by_id(&id).unwrap().is_some());
    }

    #[test]
    fn rejected_create_notifies_nobody() {
        let service = TaskService::new(Arc::new(InMemoryTaskStore::new()));
        let calls = Arc::new(Mutex::new(0));
        {
            let calls = calls.clone();
            service.register_listener(Arc::new(move |_: &Task| -> anyhow::Result<()> {
                *calls.lock().unwrap() += 1;
                Ok(())
            }));
        }

        service.create(Task::new("a", json!({})).with_id("dup")).unwrap();
        let err = service.create(Task::new("a", json!({})).with_id("dup")).unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn pass_through_writes_respect_claims() {
        let service = TaskService::new(Arc::new(InMemoryTaskStore::new()));
        let id = service.create(Task::new("a", json!({}))).unwrap();

        let claimed = service.fetch_latest(&QuerySpec::none()).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(matches!(service.delete(&id), Err(StoreError::LeaseLost(_))));

        service
            .store()
            .release(&id, claimed[0].lease_id())
            .unwrap();
        let mut task = service.find_by_id(&id).unwrap().unwrap();
        task.payload = json!({ "edited": true });
        service.update(&task).unwrap();
        service.delete(&id).unwrap();
        assert!(matches!(service.delete(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn failing_listener_keeps_the_task() {
        let service = TaskService::new(Arc::new(InMemoryTaskStore::new()));
        service.register_listener(Arc::new(|_: &Task| -> anyhow::Result<()> {
            anyhow::bail!("observer down")
        }));

        let id = service.create(Task::new("a", json!({}))).unwrap();
        assert!(service.find_by_id(&id).unwrap().is_some());
    }
}
