//! Maps task `type` strings to constructors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, ErrorKind};
use crate::task::{FnTask, Task, TaskContext, TaskFuture};

/// Constructor invoked once per task instance with `(instance_id, config)`.
pub type TaskConstructor = dyn Fn(&str, &Value) -> Arc<dyn Task> + Send + Sync;

/// Registry of task implementations. Registration is explicit; a lookup miss
/// is a graph-validation error, never a runtime surprise.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: HashMap<String, Arc<TaskConstructor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    /// Register a constructor for a task type.
    pub fn register<F>(&mut self, task_type: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&str, &Value) -> Arc<dyn Task> + Send + Sync + 'static,
    {
        self.constructors
            .insert(task_type.into(), Arc::new(constructor));
        self
    }

    /// Register a plain async function as a task type. The function receives
    /// the resolved config (and everything else) through the context.
    pub fn register_function<F, Fut>(&mut self, task_type: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        let task_type = task_type.into();
        let fn_type = task_type.clone();
        let func = Arc::new(func);
        self.register(task_type, move |_, _| {
            let func = Arc::clone(&func);
            Arc::new(FnTask::new(
                fn_type.clone(),
                Arc::new(move |ctx| -> TaskFuture { Box::pin(func(ctx)) }),
            ))
        })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.constructors.contains_key(task_type)
    }

    /// Build a task instance, failing with a validation error for unknown
    /// types.
    pub fn construct(
        &self,
        task_type: &str,
        instance_id: &str,
        config: &Value,
    ) -> Result<Arc<dyn Task>, EngineError> {
        let constructor = self.constructors.get(task_type).ok_or_else(|| {
            EngineError::new(
                ErrorKind::Validation,
                format!("task type '{}' is not registered", task_type),
            )
        })?;
        Ok(constructor(instance_id, config))
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("TaskRegistry").field("types", &types).finish()
    }
}
