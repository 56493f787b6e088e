//! Declarative workflow templates (YAML or JSON).
//!
//! A template names its tasks in an order-preserving map; declaration order
//! drives `prev*` aliases and dispatch tie-breaking, so the map order is
//! significant and kept through round-trips.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheConfig;
use crate::condition::TaskCondition;
use crate::error::{EngineError, ErrorKind};
use crate::registry::TaskRegistry;
use crate::scheduler::Workflow;
use crate::spec::{FanOut, TaskSpec};
use crate::stream::DEFAULT_STREAM_CAPACITY;

/// Root of a declarative workflow description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskTemplate>,
    /// Extra edges merged into the per-task dependency lists.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, Vec<String>>,
}

/// One task entry in a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<TaskCondition>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub produces_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consume_stream: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTemplate {
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<f64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(Map::is_empty).unwrap_or(false)
}

impl WorkflowTemplate {
    pub fn from_yaml_str(text: &str) -> Result<Self, EngineError> {
        let template: WorkflowTemplate = serde_yaml::from_str(text).map_err(|err| {
            EngineError::new(
                ErrorKind::Validation,
                format!("failed to parse workflow template: {}", err),
            )
        })?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_json_str(text: &str) -> Result<Self, EngineError> {
        let template: WorkflowTemplate = serde_json::from_str(text).map_err(|err| {
            EngineError::new(
                ErrorKind::Validation,
                format!("failed to parse workflow template: {}", err),
            )
        })?;
        template.validate()?;
        Ok(template)
    }

    /// Load a template file, dispatching on the extension (`.yaml` / `.yml`
    /// / `.json`).
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|err| {
            EngineError::new(
                ErrorKind::Io,
                format!("failed to read template {}: {}", path.display(), err),
            )
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(EngineError::new(
                ErrorKind::Validation,
                format!("template {} must be YAML or JSON", path.display()),
            )),
        }
    }

    pub fn to_yaml_string(&self) -> Result<String, EngineError> {
        serde_yaml::to_string(self).map_err(|err| {
            EngineError::new(
                ErrorKind::Serialization,
                format!("failed to serialize workflow template: {}", err),
            )
        })
    }

    /// Well-formedness checks independent of a registry.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::Validation,
                "template must specify a workflow name",
            ));
        }
        for (instance_id, task) in &self.tasks {
            if task.task_type.trim().is_empty() {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("task '{}' must specify a type", instance_id),
                ));
            }
            match (&task.for_each, &task.config_template) {
                (Some(_), None) => {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("task '{}' has for_each but no config_template", instance_id),
                    ))
                }
                (None, Some(_)) => {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("task '{}' has config_template but no for_each", instance_id),
                    ))
                }
                _ => {}
            }
            if let Some(condition) = &task.condition {
                condition
                    .validate()
                    .map_err(|err| err.with_task(instance_id.clone()))?;
            }
            if let Some(retry) = &task.retry {
                if retry.max_attempts == 0 {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("task '{}': retry.max_attempts must be >= 1", instance_id),
                    ));
                }
            }
        }
        for (instance_id, deps) in &self.dependencies {
            if !self.tasks.contains_key(instance_id) {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("dependencies listed for unknown task '{}'", instance_id),
                ));
            }
            for dep in deps {
                if !self.tasks.contains_key(dep) {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("task '{}' depends on unknown task '{}'", instance_id, dep),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build a runnable [`Workflow`] against a registry holding every task
    /// type the template names. The full graph is validated before this
    /// returns.
    pub fn build(&self, registry: TaskRegistry) -> Result<Workflow, EngineError> {
        self.validate()?;
        let mut workflow = Workflow::with_registry(self.name.clone(), registry);
        if let Some(limit) = self.max_parallel {
            workflow.set_max_parallel(limit);
        }
        if let Some(cache) = &self.cache {
            workflow.set_cache_config(cache.clone())?;
        }

        for (instance_id, task) in &self.tasks {
            let mut spec = TaskSpec::new(&task.task_type, instance_id, task.config.clone());
            for dep in &task.dependencies {
                if !spec.dependencies.contains(dep) {
                    spec.dependencies.push(dep.clone());
                }
            }
            if let Some(extra) = self.dependencies.get(instance_id) {
                for dep in extra {
                    if !spec.dependencies.contains(dep) {
                        spec.dependencies.push(dep.clone());
                    }
                }
            }
            if let (Some(for_each), Some(config_template)) =
                (&task.for_each, &task.config_template)
            {
                // A fan-out task implicitly waits for the task its sequence
                // comes from.
                let source = for_each.split('.').next().unwrap_or_default().to_string();
                if self.tasks.contains_key(&source) && !spec.dependencies.contains(&source) {
                    spec.dependencies.push(source);
                }
                spec.fan_out = Some(FanOut {
                    for_each: for_each.clone(),
                    config_template: config_template.clone(),
                    max_concurrent: task.max_concurrent.unwrap_or(1),
                });
            }
            spec.condition = task.condition.clone();
            spec.cache.enabled = task.cache_enabled;
            spec.cache.ttl_seconds = task.cache_ttl;
            spec.cache.version = task.cache_version.clone();
            if let Some(retry) = &task.retry {
                spec.retry.max_attempts = retry.max_attempts;
                spec.retry.backoff_ms = retry
                    .backoff_seconds
                    .map(|secs| (secs * 1000.0).round() as u64)
                    .unwrap_or(0);
            }
            spec.timeout_ms = task
                .timeout_seconds
                .map(|secs| (secs * 1000.0).round() as u64);
            spec.produces_stream = task.produces_stream;
            spec.stream_capacity = task.stream_capacity.unwrap_or(DEFAULT_STREAM_CAPACITY);
            spec.consumes_stream = task.consume_stream.clone();
            workflow.add_task(spec)?;
        }

        workflow.validate()?;
        Ok(workflow)
    }

    /// Canonical template for a built workflow. All dependency edges appear
    /// on the tasks themselves; building the result yields the same graph.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut tasks = IndexMap::new();
        for spec in workflow.specs() {
            let retry = if spec.retry.max_attempts != 1 || spec.retry.backoff_ms != 0 {
                Some(RetryTemplate {
                    max_attempts: spec.retry.max_attempts,
                    backoff_seconds: (spec.retry.backoff_ms > 0)
                        .then(|| spec.retry.backoff_ms as f64 / 1000.0),
                })
            } else {
                None
            };
            tasks.insert(
                spec.instance_id.clone(),
                TaskTemplate {
                    task_type: spec.task_type.clone(),
                    config: spec.config.clone(),
                    dependencies: spec.dependencies.clone(),
                    condition: spec.condition.clone(),
                    cache_enabled: spec.cache.enabled,
                    cache_ttl: spec.cache.ttl_seconds,
                    cache_version: spec.cache.version.clone(),
                    for_each: spec.fan_out.as_ref().map(|f| f.for_each.clone()),
                    config_template: spec.fan_out.as_ref().map(|f| f.config_template.clone()),
                    max_concurrent: spec.fan_out.as_ref().map(|f| f.max_concurrent),
                    retry,
                    timeout_seconds: spec.timeout_ms.map(|ms| ms as f64 / 1000.0),
                    produces_stream: spec.produces_stream,
                    stream_capacity: (spec.stream_capacity != DEFAULT_STREAM_CAPACITY)
                        .then_some(spec.stream_capacity),
                    consume_stream: spec.consumes_stream.clone(),
                },
            );
        }
        WorkflowTemplate {
            name: workflow.name().to_string(),
            max_parallel: workflow.max_parallel(),
            cache: workflow.cache_config().cloned(),
            tasks,
            dependencies: IndexMap::new(),
        }
    }
}
