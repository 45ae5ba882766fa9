use std::time::Duration;

use crate::providers::ProviderError;

/// Errors surfaced by the runtime, the activity dispatcher and the client.
///
/// Workflow and activity code itself reports failures as `Err(String)`; those
/// strings are recorded in history and come back out of this type only at the
/// client boundary (`WorkflowFailed`) or from the dispatcher (`TaskFailed`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// The instance ID already has history.
    #[error("instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("unknown activity: {0}")]
    UnknownActivity(String),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// A history write lost an optimistic concurrency race.
    #[error("version conflict on {instance}: expected {expected}, found {actual}")]
    VersionConflict { instance: String, expected: u64, actual: u64 },

    /// A single activity attempt exceeded its deadline.
    #[error("activity attempt timed out after {0:?}")]
    TaskTimeout(Duration),

    /// Terminal activity error after retry exhaustion (or a single attempt's error).
    #[error("{error}")]
    TaskFailed { task_id: u64, error: String },

    /// Uncaught error from workflow code; the instance is Failed.
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    /// A client wait exceeded its deadline.
    #[error("timed out waiting for instance {0}")]
    Timeout(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Workflow code diverged from its recorded history.
    #[error("nondeterministic workflow: {0}")]
    Nondeterminism(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for WorkflowError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::VersionConflict {
                instance,
                expected,
                actual,
            } => WorkflowError::VersionConflict {
                instance,
                expected,
                actual,
            },
            other => WorkflowError::Provider(other),
        }
    }
}

impl WorkflowError {
    /// Whether the activity dispatcher should try another attempt.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::TaskTimeout(_) | WorkflowError::TaskFailed { .. })
    }
}
