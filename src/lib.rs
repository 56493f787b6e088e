//! Workflow automation engine.
//!
//! A [`Workflow`] is a DAG of user-supplied tasks. The engine resolves
//! dependencies, wires task outputs into downstream configs through
//! `${path}` references, gates tasks on conditions, expands fan-out groups
//! over sequences at runtime, caches results per input fingerprint, enforces
//! retry/timeout policies, and couples producer/consumer task pairs with a
//! bounded stream.
//!
//! Workflows are built programmatically against a [`TaskRegistry`] or loaded
//! from YAML/JSON templates.

pub mod cache;
pub mod condition;
pub mod error;
pub mod events;
pub mod interpolate;
pub mod registry;
pub mod result;
pub mod scheduler;
pub mod spec;
pub mod store;
pub mod stream;
pub mod task;
pub mod template;

pub use cache::{Cache, CacheConfig, CacheEntry, CacheStats};
pub use condition::{ConditionOp, TaskCondition};
pub use error::{EngineError, ErrorKind};
pub use events::RunEvent;
pub use registry::TaskRegistry;
pub use result::{ErrorSummary, TaskResult};
pub use scheduler::Workflow;
pub use spec::{CachePolicy, FanOut, RetryPolicy, TaskSpec};
pub use store::{RefScope, ValueStore};
pub use stream::{StreamReceiver, StreamSender, DEFAULT_STREAM_CAPACITY};
pub use task::{FnTask, Task, TaskContext, TaskFuture};
pub use template::WorkflowTemplate;

pub type Result<T> = std::result::Result<T, EngineError>;
