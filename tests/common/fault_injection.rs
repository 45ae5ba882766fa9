//! Store wrappers that inject faults for exercising the runtime's retry paths.

#![allow(dead_code)]

use async_trait::async_trait;
use durable_workflow::Event;
use durable_workflow::providers::{HistoryStore, ProviderError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Fails the next N appends (after the first `skip`) with a version conflict
/// without touching the inner store, as if another writer had raced ahead.
pub struct ConflictInjectingStore {
    inner: Arc<dyn HistoryStore>,
    skip: AtomicU32,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl ConflictInjectingStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            skip: AtomicU32::new(0),
            remaining: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    /// Let `skip` appends through, then conflict `count` times.
    pub fn inject_conflicts(&self, skip: u32, count: u32) {
        self.skip.store(skip, Ordering::SeqCst);
        self.remaining.store(count, Ordering::SeqCst);
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for ConflictInjectingStore {
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_events(instance).await
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        // ExecutionStarted appends are left alone; a conflict there means duplicate.
        if expected_version > 0 && self.remaining.load(Ordering::SeqCst) > 0 {
            if self.skip.load(Ordering::SeqCst) > 0 {
                self.skip.fetch_sub(1, Ordering::SeqCst);
            } else {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                self.injected.fetch_add(1, Ordering::SeqCst);
                return Err(ProviderError::version_conflict(instance, expected_version, expected_version + 1));
            }
        }
        self.inner.append_events(instance, expected_version, events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}

/// Fails reads with a permanent storage error once armed, optionally after
/// letting a number of reads through first.
pub struct FailingReadStore {
    inner: Arc<dyn HistoryStore>,
    armed: AtomicBool,
    pass_reads: AtomicU32,
}

impl FailingReadStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            pass_reads: AtomicU32::new(0),
        }
    }

    pub fn arm(&self) {
        self.fail_reads_after(0);
    }

    /// Let `reads` more reads succeed, then fail every one after.
    pub fn fail_reads_after(&self, reads: u32) {
        self.pass_reads.store(reads, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for FailingReadStore {
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        if self.armed.load(Ordering::SeqCst)
            && self
                .pass_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(ProviderError::permanent("read_events", "disk unavailable"));
        }
        self.inner.read_events(instance).await
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        self.inner.append_events(instance, expected_version, events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}

/// Holds every append past `ExecutionStarted` until the gate is opened.
pub struct GatedAppendStore {
    inner: Arc<dyn HistoryStore>,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GatedAppendStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Appends currently parked at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.close();
    }
}

#[async_trait]
impl HistoryStore for GatedAppendStore {
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_events(instance).await
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        if expected_version > 0 {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            // resolves once the gate is closed
            let _ = self.gate.acquire().await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.append_events(instance, expected_version, events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}
