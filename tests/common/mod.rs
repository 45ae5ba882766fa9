#![allow(dead_code)]

pub mod fault_injection;
pub mod tracing_capture;

use durable_workflow::providers::HistoryStore;
use durable_workflow::providers::fs::FsHistoryStore;
use durable_workflow::providers::in_memory::InMemoryHistoryStore;
use durable_workflow::{Event, EventKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new())
}

pub fn create_fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true).unwrap();
    (Arc::new(store), td)
}

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read_events(instance).await.unwrap();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_scheduled(hist: &[Event], activity: &str) -> usize {
    hist.iter()
        .filter(|e| matches!(&e.kind, EventKind::TaskScheduled { name, .. } if name == activity))
        .count()
}

pub fn count_terminal(hist: &[Event]) -> usize {
    hist.iter().filter(|e| e.kind.is_terminal()).count()
}
