/// History store error with retry classification.
///
/// Stores return this error type so the runtime can tell an optimistic
/// concurrency race apart from storage failures, and transient storage
/// failures apart from permanent ones.
///
/// # Error Classification
///
/// **VersionConflict**: another writer appended to the instance first. The
/// runtime re-reads the history and re-executes the turn.
///
/// **Retryable storage errors**:
/// - Store busy/locked
/// - I/O interruptions
///
/// **Permanent storage errors**:
/// - Corrupt or unparsable history
/// - Non-contiguous event ids in an append
///
/// # Example Usage
///
/// ```rust,no_run
/// use durable_workflow::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("append_events", "file is locked"));
/// # }
/// # fn example2() -> Result<(), ProviderError> {
/// return Err(ProviderError::permanent("read_events", "line 3 is not valid JSON"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The instance history is not at the version the writer expected.
    #[error("version conflict on {instance}: expected version {expected}, found {actual}")]
    VersionConflict { instance: String, expected: u64, actual: u64 },
    /// Backend failure for `operation`.
    #[error("{operation}: {message}")]
    Storage {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ProviderError {
    /// Create a retryable (transient) storage error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) storage error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn version_conflict(instance: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            instance: instance.into(),
            expected,
            actual,
        }
    }

    /// Whether the runtime may retry the operation that produced this error.
    ///
    /// Version conflicts are always retryable: the retry re-reads history first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. } => true,
            Self::Storage { retryable, .. } => *retryable,
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        let retryable = matches!(
            e.kind(),
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        );
        Self::Storage {
            operation: "io".to_string(),
            message: e.to_string(),
            retryable,
        }
    }
}
