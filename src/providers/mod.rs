use crate::Event;

mod error;
pub use error::ProviderError;

/// Storage abstraction for append-only workflow history per instance.
///
/// An instance's version is the number of events in its history. Writers
/// pass the version they read; a store must reject the append with
/// [`ProviderError::VersionConflict`] when the history has moved since.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full history for an instance. Unknown instances read as empty.
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Append `events` if the current version equals `expected_version`.
    /// Returns the new version.
    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError>;

    /// Enumerate instances that have any history.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Current version of an instance (0 if it does not exist).
    async fn version(&self, instance: &str) -> Result<u64, ProviderError> {
        Ok(self.read_events(instance).await?.len() as u64)
    }
}

/// Event ids must continue the sequence right after `expected_version`.
pub(crate) fn check_contiguous(instance: &str, expected_version: u64, events: &[Event]) -> Result<(), ProviderError> {
    for (offset, e) in events.iter().enumerate() {
        let want = expected_version + offset as u64 + 1;
        if e.event_id != want {
            return Err(ProviderError::permanent(
                "append_events",
                format!("{instance}: event id {} does not continue the history (expected {want})", e.event_id),
            ));
        }
    }
    Ok(())
}

/// In-memory provider for tests and single-process use.
pub mod in_memory;
/// Filesystem-backed provider that survives process restarts.
pub mod fs;
