use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Uniform envelope returned by every task, including skipped and cached ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub skipped: bool,
}

/// Serializable summary of a task failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: String,
    pub message: String,
    /// Instance id of the task where the failure originated, when the failure
    /// was inherited through the dependency graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ErrorSummary {
    pub fn from_error(error: &EngineError) -> Self {
        ErrorSummary {
            kind: error.kind.as_str().to_string(),
            message: error.message.clone(),
            origin: None,
        }
    }
}

fn empty_output() -> Value {
    Value::Object(Map::new())
}

impl TaskResult {
    pub fn completed(output: Value, started_at: DateTime<Utc>, attempts: u32) -> Self {
        TaskResult {
            success: true,
            output,
            error: None,
            started_at,
            finished_at: Utc::now(),
            attempts,
            skipped: false,
        }
    }

    pub fn failed(error: &EngineError, started_at: DateTime<Utc>, attempts: u32) -> Self {
        TaskResult {
            success: false,
            output: empty_output(),
            error: Some(ErrorSummary::from_error(error)),
            started_at,
            finished_at: Utc::now(),
            attempts,
            skipped: false,
        }
    }

    /// Result recorded for a cache hit. Nothing executed, so `attempts` is 0
    /// and the timestamps collapse to the lookup instant.
    pub fn from_cache(output: Value, started_at: DateTime<Utc>) -> Self {
        TaskResult {
            success: true,
            output,
            error: None,
            started_at,
            finished_at: Utc::now(),
            attempts: 0,
            skipped: false,
        }
    }

    /// Sentinel for a task whose condition evaluated to false.
    pub fn skipped_by_condition() -> Self {
        let now = Utc::now();
        TaskResult {
            success: true,
            output: empty_output(),
            error: None,
            started_at: now,
            finished_at: now,
            attempts: 0,
            skipped: true,
        }
    }

    /// Sentinel for a task skipped because a (transitive) dependency failed.
    /// `origin` names the task where the failure started.
    pub fn skipped_by_upstream(origin: &str) -> Self {
        let now = Utc::now();
        TaskResult {
            success: true,
            output: empty_output(),
            error: Some(ErrorSummary {
                kind: "upstream".to_string(),
                message: format!("skipped: upstream task '{}' failed", origin),
                origin: Some(origin.to_string()),
            }),
            started_at: now,
            finished_at: now,
            attempts: 0,
            skipped: true,
        }
    }

    /// Result recorded for a task the workflow cancelled before completion.
    pub fn cancelled() -> Self {
        let now = Utc::now();
        TaskResult {
            success: false,
            output: empty_output(),
            error: Some(ErrorSummary {
                kind: "cancelled".to_string(),
                message: "workflow cancelled before the task finished".to_string(),
                origin: None,
            }),
            started_at: now,
            finished_at: now,
            attempts: 0,
            skipped: false,
        }
    }

    /// True when the task ran (or hit the cache) and produced its output.
    pub fn executed(&self) -> bool {
        self.success && !self.skipped
    }
}
