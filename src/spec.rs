//! Static task descriptions consumed by the scheduler.

use serde_json::Value;

use crate::condition::TaskCondition;
use crate::error::{EngineError, ErrorKind};
use crate::stream::DEFAULT_STREAM_CAPACITY;

/// Retry configuration for a task. Backoff is a fixed wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::new(
                ErrorKind::Validation,
                "retry.max_attempts must be >= 1",
            ));
        }
        Ok(())
    }
}

/// Per-task cache settings.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_seconds: Option<u64>,
    /// Optional salt folded into the fingerprint so callers can invalidate
    /// cached lines when a task implementation changes.
    pub version: Option<String>,
}

/// Dynamic task-group settings: one child per element of the sequence the
/// `for_each` reference resolves to.
#[derive(Debug, Clone)]
pub struct FanOut {
    pub for_each: String,
    pub config_template: Value,
    pub max_concurrent: usize,
}

/// The static description of one workflow node.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub instance_id: String,
    pub task_type: String,
    pub config: Value,
    /// Declaration order matters: it drives the `prev*` aliases and the
    /// scheduler's tie-breaking.
    pub dependencies: Vec<String>,
    pub condition: Option<TaskCondition>,
    pub cache: CachePolicy,
    pub retry: RetryPolicy,
    pub timeout_ms: Option<u64>,
    pub fan_out: Option<FanOut>,
    pub produces_stream: bool,
    pub stream_capacity: usize,
    pub consumes_stream: Option<String>,
}

impl TaskSpec {
    pub fn new(
        task_type: impl Into<String>,
        instance_id: impl Into<String>,
        config: Value,
    ) -> Self {
        TaskSpec {
            instance_id: instance_id.into(),
            task_type: task_type.into(),
            config,
            dependencies: Vec::new(),
            condition: None,
            cache: CachePolicy::default(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
            fan_out: None,
            produces_stream: false,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            consumes_stream: None,
        }
    }

    pub fn with_dependency(mut self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        if !self.dependencies.contains(&parent) {
            self.dependencies.push(parent);
        }
        self
    }

    pub fn with_condition(mut self, condition: TaskCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_cache(mut self, ttl_seconds: Option<u64>) -> Self {
        self.cache.enabled = true;
        self.cache.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache.version = Some(version.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            backoff_ms,
        };
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_fan_out(
        mut self,
        for_each: impl Into<String>,
        config_template: Value,
        max_concurrent: usize,
    ) -> Self {
        self.fan_out = Some(FanOut {
            for_each: for_each.into(),
            config_template,
            max_concurrent,
        });
        self
    }

    pub fn produces_stream(mut self) -> Self {
        self.produces_stream = true;
        self
    }

    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    pub fn consumes_stream(mut self, producer: impl Into<String>) -> Self {
        self.consumes_stream = Some(producer.into());
        self
    }

    /// Structural checks that do not need the surrounding graph.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.instance_id.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::Validation,
                "task instance_id must not be empty",
            ));
        }
        if self.task_type.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("task '{}' has an empty type", self.instance_id),
            ));
        }
        self.retry
            .validate()
            .map_err(|err| err.with_task(self.instance_id.clone()))?;
        if let Some(condition) = &self.condition {
            condition
                .validate()
                .map_err(|err| err.with_task(self.instance_id.clone()))?;
        }
        if let Some(fan_out) = &self.fan_out {
            if fan_out.max_concurrent == 0 {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("task '{}': max_concurrent must be >= 1", self.instance_id),
                ));
            }
            if !fan_out.config_template.is_object() {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("task '{}': config_template must be a map", self.instance_id),
                ));
            }
            if fan_out.for_each.trim().is_empty() {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("task '{}': for_each path must not be empty", self.instance_id),
                ));
            }
        }
        if self.stream_capacity == 0 {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("task '{}': stream_capacity must be >= 1", self.instance_id),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_deduplicates_dependencies() {
        let spec = TaskSpec::new("counter", "count", json!({}))
            .with_dependency("gen")
            .with_dependency("gen");
        assert_eq!(spec.dependencies, vec!["gen"]);
    }

    #[test]
    fn zero_attempts_rejected() {
        let spec = TaskSpec::new("counter", "count", json!({})).with_retry(0, 0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn fan_out_requires_map_template() {
        let spec = TaskSpec::new("check", "check", json!({})).with_fan_out(
            "scan.items",
            json!([1, 2]),
            5,
        );
        assert!(spec.validate().is_err());
    }
}
