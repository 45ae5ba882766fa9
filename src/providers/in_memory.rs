use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{HistoryStore, ProviderError, check_contiguous};
use crate::Event;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<Event>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretty-printed dump of every instance (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut names: Vec<&String> = g.keys().collect();
        names.sort();
        let mut out = String::new();
        for inst in names {
            out.push_str(&format!("instance={inst}\n"));
            for e in &g[inst] {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).cloned().unwrap_or_default())
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let mut g = self.inner.lock().await;
        let actual = g.get(instance).map(|h| h.len() as u64).unwrap_or(0);
        if actual != expected_version {
            return Err(ProviderError::version_conflict(instance, expected_version, actual));
        }
        check_contiguous(instance, expected_version, &events)?;
        if events.is_empty() {
            return Ok(actual);
        }
        let history = g.entry(instance.to_string()).or_default();
        history.extend(events);
        Ok(history.len() as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.inner.lock().await.keys().cloned().collect())
    }

    async fn version(&self, instance: &str) -> Result<u64, ProviderError> {
        Ok(self.inner.lock().await.get(instance).map(|h| h.len() as u64).unwrap_or(0))
    }
}
