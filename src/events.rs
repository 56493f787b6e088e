//! Run-progress events, delivered over an optional unbounded channel so
//! observers never slow the scheduler down.

use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle notifications emitted while a workflow runs.
#[derive(Debug, Clone)]
pub enum RunEvent {
    WorkflowStarted {
        run_id: Uuid,
        workflow: String,
    },
    TaskStarted {
        instance_id: String,
        attempt: u32,
    },
    TaskCompleted {
        instance_id: String,
        success: bool,
        from_cache: bool,
        attempts: u32,
    },
    TaskSkipped {
        instance_id: String,
        /// Instance id of the originating failure for upstream skips; absent
        /// for condition skips.
        upstream: Option<String>,
    },
    WorkflowFinished {
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Fire-and-forget emitter; a missing or closed subscriber is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::UnboundedSender<RunEvent>>) -> Self {
        EventSink { tx }
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
