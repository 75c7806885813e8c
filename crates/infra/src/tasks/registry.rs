//! Task-type to executor routing, validated at startup.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use ctlplane_core::{StoreError, panic_message};

use super::types::{ExecutionResult, Task, TaskType};

/// Handler for one task type.
///
/// Returning `Err` is treated like `RetryableFailure`.
pub trait TaskExecutor: Send + Sync {
    fn handle(&self, payload: &Value) -> anyhow::Result<ExecutionResult>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&Value) -> anyhow::Result<ExecutionResult> + Send + Sync,
{
    fn handle(&self, payload: &Value) -> anyhow::Result<ExecutionResult> {
        self(payload)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("executor already registered for task type {0}")]
    DuplicateExecutor(TaskType),

    #[error("no executor registered for expected task types: {0:?}")]
    MissingExecutors(Vec<TaskType>),

    #[error("no executor registered for task type {0}")]
    ExecutorNotRegistered(TaskType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Immutable executor table.
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskExecutor>> {
        self.executors.get(task_type)
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.executors.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn task_types(&self) -> Vec<&TaskType> {
        let mut types: Vec<&TaskType> = self.executors.keys().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Run the executor for `task`.
    ///
    /// Errors and panics raised by the executor become `RetryableFailure`;
    /// the only error returned here is a missing executor.
    pub fn execute(&self, task: &Task) -> Result<ExecutionResult, DispatchError> {
        let executor = self
            .get(&task.task_type)
            .ok_or_else(|| DispatchError::ExecutorNotRegistered(task.task_type.clone()))?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.handle(&task.payload)));
        Ok(match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::RetryableFailure(format!("{e:#}")),
            Err(panic) => ExecutionResult::RetryableFailure(format!(
                "executor panicked: {}",
                panic_message(&*panic)
            )),
        })
    }
}

/// Builder for [`ExecutorRegistry`].
#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
    expected: BTreeSet<TaskType>,
}

impl ExecutorRegistryBuilder {
    /// Register the executor for `task_type`. A second registration for the
    /// same type fails.
    pub fn register(
        mut self,
        task_type: impl Into<TaskType>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, DispatchError> {
        let task_type = task_type.into();
        if self.executors.contains_key(&task_type) {
            return Err(DispatchError::DuplicateExecutor(task_type));
        }

        debug!(task_type = %task_type, "registered task executor");
        self.executors.insert(task_type, executor);
        Ok(self)
    }

    /// Register a closure as the executor for `task_type`.
    pub fn register_fn<F>(self, task_type: impl Into<TaskType>, f: F) -> Result<Self, DispatchError>
    where
        F: Fn(&Value) -> anyhow::Result<ExecutionResult> + Send + Sync + 'static,
    {
        self.register(task_type, Arc::new(f))
    }

    /// Types that must have an executor once `build` is called.
    pub fn expect_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskType>,
    {
        self.expected.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<ExecutorRegistry, DispatchError> {
        let missing: Vec<TaskType> = self
            .expected
            .into_iter()
            .filter(|t| !self.executors.contains_key(t))
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::MissingExecutors(missing));
        }

        Ok(ExecutorRegistry {
            executors: self.executors,
        })
    }
}
