//! The task capability exposed to user code.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::store::{RefScope, ValueStore};
use crate::stream::{StreamReceiver, StreamSender};

/// Everything a task sees while executing: its resolved config, the attempt
/// number, a cancellation token it is expected to honour, read access to
/// dependency outputs, and stream handles when the task takes part in a
/// producer/consumer pair.
pub struct TaskContext {
    instance_id: String,
    pub config: Value,
    attempt: u32,
    pub cancel: CancellationToken,
    store: Arc<RwLock<ValueStore>>,
    dependencies: Arc<Vec<String>>,
    stream_out: Option<StreamSender>,
    stream_in: Option<StreamReceiver>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance_id: String,
        config: Value,
        attempt: u32,
        cancel: CancellationToken,
        store: Arc<RwLock<ValueStore>>,
        dependencies: Arc<Vec<String>>,
        stream_out: Option<StreamSender>,
        stream_in: Option<StreamReceiver>,
    ) -> Self {
        TaskContext {
            instance_id,
            config,
            attempt,
            cancel,
            store,
            dependencies,
            stream_out,
            stream_in,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 1-based attempt number under the retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.as_object().and_then(|map| map.get(key))
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_value(key).and_then(Value::as_str)
    }

    /// Resolve a dotted path against finished task results, including the
    /// `prev*` aliases. Works for any dependency that has reached a terminal
    /// state, which for stream consumers includes the producer once it
    /// completes.
    pub async fn output(&self, path: &str) -> Result<Value, EngineError> {
        let store = self.store.read().await;
        let scope = RefScope::new(&self.instance_id, &self.dependencies);
        store.resolve_path(path, &scope)
    }

    /// Output of the dependency declared last, whole.
    pub async fn latest_output(&self) -> Result<Value, EngineError> {
        self.output("prev").await
    }

    /// Publish handle when this task is a stream producer.
    pub fn publisher(&self) -> Option<&StreamSender> {
        self.stream_out.as_ref()
    }

    /// Take the subscription when this task is a stream consumer. The
    /// receiver can be taken once; later calls return `None`.
    pub fn take_stream(&mut self) -> Option<StreamReceiver> {
        self.stream_in.take()
    }
}

/// A user-defined unit of work.
///
/// Implementations return their output tree on success; failures are ordinary
/// `EngineError`s and are subject to the task's retry policy. Tasks doing
/// blocking I/O must document it; the engine performs no thread offloading.
#[async_trait]
pub trait Task: Send + Sync {
    /// Registry key identifying this task implementation.
    fn task_type(&self) -> &str;

    async fn execute(&self, ctx: TaskContext) -> Result<Value, EngineError>;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("task_type", &self.task_type()).finish()
    }
}

/// Boxed future returned by function tasks.
pub type TaskFuture = BoxFuture<'static, Result<Value, EngineError>>;

/// Adapter wrapping a plain async function into a [`Task`].
pub struct FnTask {
    type_name: String,
    func: Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>,
}

impl FnTask {
    pub fn new(
        type_name: impl Into<String>,
        func: Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>,
    ) -> Self {
        FnTask {
            type_name: type_name.into(),
            func,
        }
    }
}

#[async_trait]
impl Task for FnTask {
    fn task_type(&self) -> &str {
        &self.type_name
    }

    async fn execute(&self, ctx: TaskContext) -> Result<Value, EngineError> {
        (self.func)(ctx).await
    }
}
