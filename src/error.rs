use std::fmt;

/// Failure categories surfaced by the engine.
///
/// The category decides how the scheduler reacts: task and timeout failures
/// are retried, reference failures are not (the input cannot change by
/// retrying), cache backend failures degrade to misses, and upstream failures
/// turn into skips instead of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed graph or template detected before the workflow starts.
    Validation,
    /// A `${path}` or `for_each` reference could not be resolved at runtime.
    Reference,
    /// A condition expression could not be parsed or evaluated.
    Condition,
    /// The task itself failed.
    Task,
    /// The task exceeded its time budget.
    Timeout,
    /// A cache backend operation failed.
    CacheBackend,
    /// A dependency failed; the owning task was skipped.
    Upstream,
    /// The workflow was cancelled before the task finished.
    Cancelled,
    Serialization,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Reference => "reference",
            ErrorKind::Condition => "condition",
            ErrorKind::Task => "task",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CacheBackend => "cache_backend",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        }
    }

    /// Whether a failure of this kind is worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Task | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type used throughout the engine.
#[derive(Debug)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub task: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn new<T: Into<String>>(kind: ErrorKind, message: T) -> Self {
        EngineError {
            kind,
            message: message.into(),
            task: None,
            source: None,
        }
    }

    pub fn with_source<T: Into<String>>(
        kind: ErrorKind,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = EngineError::new(kind, message);
        error.source = Some(source);
        error
    }

    /// Attach the instance id of the task the error belongs to.
    pub fn with_task<T: Into<String>>(mut self, task: T) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ref task) = self.task {
            write!(f, " (task: {})", task)?;
        }
        if let Some(ref source) = self.source {
            write!(f, "\nCaused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::with_source(ErrorKind::Io, err.to_string(), Box::new(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::with_source(ErrorKind::Serialization, err.to_string(), Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_controls_retriability() {
        assert!(EngineError::new(ErrorKind::Task, "boom").is_retriable());
        assert!(EngineError::new(ErrorKind::Timeout, "slow").is_retriable());
        assert!(!EngineError::new(ErrorKind::Reference, "missing").is_retriable());
        assert!(!EngineError::new(ErrorKind::Cancelled, "stop").is_retriable());
    }

    #[test]
    fn display_includes_task_id() {
        let err = EngineError::new(ErrorKind::Task, "boom").with_task("fetch");
        assert_eq!(err.to_string(), "[task] boom (task: fetch)");
    }
}
