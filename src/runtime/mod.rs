//! Orchestrator engine: per-instance replay loop, completion intake and
//! background dispatchers.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::providers::{HistoryStore, ProviderError};
use crate::{Event, EventKind, ParentLink, WorkflowContext, WorkflowError};

mod dispatchers;
pub mod observability;
mod recovery;
pub mod registry;
pub mod replay_engine;
mod retry;
pub mod state_helpers;
mod timers;

pub use dispatchers::ActivityDispatcher;
pub use observability::{MetricsSnapshot, RuntimeMetrics};
pub use registry::{ActivityRegistry, WorkflowRegistry};
pub use retry::{DEFAULT_ATTEMPT_TIMEOUT, RetryPolicy};
pub use state_helpers::HistoryManager;

use replay_engine::{ReplayEngine, TurnResult};
use timers::{TimerSchedule, now_ms};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum number of activity executions running at once.
    pub worker_concurrency: usize,
    /// Retry policy for activities registered without their own.
    pub default_retry_policy: RetryPolicy,
    /// Retries for retryable history appends (version conflicts included).
    /// Backoff is 10ms doubled per attempt.
    pub max_append_retries: u32,
    /// How often client waits re-read status between notifications.
    pub client_poll_interval: Duration,
    /// When false, scheduled activities are only recorded; callers complete
    /// them through [`Runtime::complete_task`].
    pub auto_dispatch_activities: bool,
    /// Run [`Runtime::recover`] during start.
    pub recover_on_start: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            default_retry_policy: RetryPolicy::default(),
            max_append_retries: 5,
            client_poll_interval: Duration::from_millis(10),
            auto_dispatch_activities: true,
            recover_on_start: true,
        }
    }
}

/// High-level instance status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Created, no turn has run yet
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed { .. } | RuntimeStatus::Failed { .. } | RuntimeStatus::Terminated { .. }
        )
    }
}

/// Snapshot of one instance derived from its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub workflow_name: String,
    pub status: RuntimeStatus,
    pub input: String,
    /// Output when Completed, error when Failed
    pub output: Option<String>,
    pub parent: Option<ParentLink>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl WorkflowInstance {
    pub fn into_result(self) -> Result<String, WorkflowError> {
        match self.status {
            RuntimeStatus::Completed { output } => Ok(output),
            RuntimeStatus::Failed { error } => Err(WorkflowError::WorkflowFailed(error)),
            RuntimeStatus::Terminated { reason } => Err(WorkflowError::WorkflowFailed(format!("terminated: {reason}"))),
            RuntimeStatus::Pending | RuntimeStatus::Running => Err(WorkflowError::Timeout(self.instance_id)),
        }
    }
}

/// What a `process_instance` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing new in history since the last turn
    NoProgress,
    /// The turn parked on unresolved work after recording `new_tasks` schedules
    Suspended { new_tasks: usize },
    Completed { output: String },
    Failed { error: String },
    AlreadyTerminal,
}

/// Whether a completion was written to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    /// Late, unknown or duplicate completion; history is unchanged
    Discarded,
}

/// An activity scheduled in history that has not completed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTask {
    pub instance_id: String,
    pub task_id: u64,
    pub name: String,
    pub input: String,
}

/// Per-attempt metadata handed to activity implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    task_id: u64,
    name: String,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, task_id: u64, name: impl Into<String>, attempt: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id,
            name: name.into(),
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Trait implemented by workflow handlers that can be invoked by the runtime.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Messages consumed by the orchestrator dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OrchestratorMsg {
    Process {
        instance: String,
    },
    TaskResult {
        instance: String,
        task_id: u64,
        result: Result<String, String>,
        attempt: u32,
    },
    TimerFired {
        instance: String,
        task_id: u64,
        fire_at_ms: u64,
    },
    ChildResult {
        parent: ParentLink,
        child_instance: String,
        result: Result<String, String>,
    },
}

/// Held instance lock. Dropping it removes the map entry once no other
/// caller holds or waits on the same lock.
struct InstanceGuard<'a> {
    runtime: &'a Runtime,
    instance: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.runtime.instance_locks.lock().unwrap_or_else(|e| e.into_inner());
        // the map entry and `self.lock` are the only references left
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.instance);
        }
    }
}

/// In-process runtime that replays workflows, executes activities and timers
/// and persists history via a `HistoryStore`.
pub struct Runtime {
    runtime_id: String,
    store: Arc<dyn HistoryStore>,
    workflows: WorkflowRegistry,
    dispatcher: Arc<ActivityDispatcher>,
    options: RuntimeOptions,
    metrics: Arc<RuntimeMetrics>,
    instance_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: std::sync::Mutex<HashMap<String, HashMap<u64, AbortHandle>>>,
    worker_permits: Arc<Semaphore>,
    orchestrator_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    timer_tx: mpsc::UnboundedSender<TimerSchedule>,
    status_changed: Notify,
    joins: Mutex<Vec<JoinHandle<()>>>,
    orchestrator_tasks: std::sync::Mutex<JoinSet<()>>,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
    ) -> Result<Arc<Self>, WorkflowError> {
        Self::start_with_options(store, activities, workflows, RuntimeOptions::default()).await
    }

    /// Start a runtime with custom options.
    ///
    /// Spawns the orchestrator dispatcher and the timer service, then runs
    /// crash recovery unless `recover_on_start` is off.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, WorkflowError> {
        let (orchestrator_tx, orchestrator_rx) = mpsc::unbounded_channel();
        let (timer_handle, timer_tx) = timers::TimerService::start(orchestrator_tx.clone());
        let metrics = Arc::new(RuntimeMetrics::default());
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let runtime = Arc::new(Self {
            dispatcher: Arc::new(ActivityDispatcher::new(
                activities,
                options.default_retry_policy.clone(),
                metrics.clone(),
            )),
            runtime_id,
            store,
            workflows,
            metrics,
            instance_locks: std::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            worker_permits: Arc::new(Semaphore::new(options.worker_concurrency.max(1))),
            orchestrator_tx,
            timer_tx,
            status_changed: Notify::new(),
            joins: Mutex::new(vec![timer_handle]),
            orchestrator_tasks: std::sync::Mutex::new(JoinSet::new()),
            options,
        });

        let handle = runtime.clone().start_orchestration_dispatcher(orchestrator_rx);
        runtime.joins.lock().await.push(handle);

        info!(
            target: "durable_workflow::runtime",
            runtime_id = %runtime.runtime_id,
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );

        if runtime.options.recover_on_start {
            runtime.recover().await?;
        }
        Ok(runtime)
    }

    /// Abort background tasks and in-flight activities. Orchestrator
    /// messages still being handled are cancelled and awaited, so nothing is
    /// appended to the store once this returns.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
            let _ = j.await;
        }
        let mut handlers = std::mem::take(&mut *self.orchestrator_tasks_guard());
        handlers.shutdown().await;
        let in_flight: Vec<AbortHandle> = self
            .in_flight_guard()
            .drain()
            .flat_map(|(_, tasks)| tasks.into_values())
            .collect();
        for h in in_flight {
            h.abort();
        }
        self.worker_permits.close();
        debug!(target: "durable_workflow::runtime", runtime_id = %self.runtime_id, "runtime shut down");
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn status_changed(&self) -> &Notify {
        &self.status_changed
    }

    fn in_flight_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u64, AbortHandle>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn orchestrator_tasks_guard(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.orchestrator_tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialize turns, completions and termination of one instance.
    async fn lock_instance(&self, instance: &str) -> InstanceGuard<'_> {
        let lock = self
            .instance_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = Arc::clone(&lock).lock_owned().await;
        InstanceGuard {
            runtime: self,
            instance: instance.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of instances with a held or awaited lock.
    pub fn locked_instances(&self) -> usize {
        self.instance_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn enqueue_process(&self, instance: &str) {
        let _ = self.orchestrator_tx.send(OrchestratorMsg::Process {
            instance: instance.to_string(),
        });
    }

    /// Sleep before retrying `op` if `err` is retryable and attempts remain.
    async fn should_retry(&self, instance: &str, op: &str, err: &ProviderError, attempts: &mut u32) -> bool {
        if !err.is_retryable() || *attempts >= self.options.max_append_retries {
            return false;
        }
        if err.is_version_conflict() {
            self.metrics.record_append_conflict();
        }
        let backoff_ms = 10u64.saturating_mul(1 << (*attempts).min(16));
        warn!(
            target: "durable_workflow::runtime",
            instance_id = %instance,
            attempts = *attempts,
            backoff_ms,
            error = %err,
            "{op} failed; retrying"
        );
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        *attempts += 1;
        true
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, WorkflowError> {
        let mut attempts = 0;
        loop {
            match self.store.read_events(instance).await {
                Ok(history) => return Ok(history),
                Err(e) => {
                    if !self.should_retry(instance, "read_events", &e, &mut attempts).await {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Create a new instance of a registered workflow type.
    pub async fn schedule(&self, workflow_type: &str, instance_id: &str, input: &str) -> Result<(), WorkflowError> {
        if !self.workflows.has(workflow_type) {
            return Err(WorkflowError::UnknownWorkflowType(workflow_type.to_string()));
        }
        let started = EventKind::ExecutionStarted {
            name: workflow_type.to_string(),
            input: input.to_string(),
            parent: None,
        };
        self.create_instance(instance_id, started).await?;
        info!(
            target: "durable_workflow::runtime",
            instance_id = %instance_id,
            workflow_name = %workflow_type,
            "instance scheduled"
        );
        self.enqueue_process(instance_id);
        Ok(())
    }

    /// Append `ExecutionStarted` to an empty history; any existing history is a duplicate.
    async fn create_instance(&self, instance_id: &str, started: EventKind) -> Result<(), WorkflowError> {
        let mut attempts = 0;
        loop {
            let event = Event::new(1, now_ms(), started.clone());
            match self.store.append_events(instance_id, 0, vec![event]).await {
                Ok(_) => {
                    self.status_changed.notify_waiters();
                    return Ok(());
                }
                Err(ProviderError::VersionConflict { .. }) => {
                    return Err(WorkflowError::DuplicateInstance(instance_id.to_string()));
                }
                Err(e) => {
                    if !self.should_retry(instance_id, "append_events", &e, &mut attempts).await {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Run one turn for `instance` if history holds anything the last turn did not see.
    pub async fn process_instance(self: &Arc<Self>, instance: &str) -> Result<ProcessOutcome, WorkflowError> {
        let guard = self.lock_instance(instance).await;
        let mut attempts = 0;

        let (engine, result, parent) = loop {
            let history = self.read_history(instance).await?;
            let mgr = HistoryManager::from_history(&history);
            let Some(workflow_name) = mgr.workflow_name.clone() else {
                return Err(WorkflowError::InstanceNotFound(instance.to_string()));
            };
            if mgr.is_terminal() {
                return Ok(ProcessOutcome::AlreadyTerminal);
            }
            if !mgr.has_unobserved_events() {
                return Ok(ProcessOutcome::NoProgress);
            }

            let version = mgr.version();
            let mut engine = ReplayEngine::new(instance, history);
            let now = now_ms();
            let result = match self.workflows.get(&workflow_name) {
                Some(handler) => engine.execute_workflow(handler, mgr.input.clone().unwrap_or_default(), now),
                None => engine.fail(WorkflowError::UnknownWorkflowType(workflow_name).to_string(), now),
            };

            match self
                .store
                .append_events(instance, version, engine.history_delta().to_vec())
                .await
            {
                Ok(_) => break (engine, result, mgr.parent),
                Err(e) => {
                    if !self.should_retry(instance, "append_events", &e, &mut attempts).await {
                        return Err(e.into());
                    }
                }
            }
        };

        crate::logging::emit_records(instance, &engine.logs);
        drop(guard);

        let new_tasks = engine.pending_actions.len();
        self.apply_actions(instance, engine.pending_actions).await;

        let outcome = match result {
            TurnResult::Continue => ProcessOutcome::Suspended { new_tasks },
            TurnResult::Completed(output) => {
                self.metrics.record_workflow_completion();
                info!(target: "durable_workflow::runtime", instance_id = %instance, "workflow completed");
                if let Some(parent) = parent {
                    self.notify_parent(parent, instance, Ok(output.clone()));
                }
                ProcessOutcome::Completed { output }
            }
            TurnResult::Failed(error) => {
                self.metrics.record_workflow_failure();
                warn!(target: "durable_workflow::runtime", instance_id = %instance, error = %error, "workflow failed");
                if let Some(parent) = parent {
                    self.notify_parent(parent, instance, Err(error.clone()));
                }
                ProcessOutcome::Failed { error }
            }
        };
        self.status_changed.notify_waiters();
        Ok(outcome)
    }

    /// Append a completion event under the instance lock if it is still wanted.
    pub(crate) async fn record_completion(
        &self,
        instance: &str,
        completion: EventKind,
    ) -> Result<CompletionOutcome, WorkflowError> {
        let Some(task_id) = completion.task_id() else {
            return Ok(CompletionOutcome::Discarded);
        };
        let _guard = self.lock_instance(instance).await;
        let mut attempts = 0;
        loop {
            let history = self.read_history(instance).await?;
            let mgr = HistoryManager::from_history(&history);
            if !mgr.exists() {
                return Err(WorkflowError::InstanceNotFound(instance.to_string()));
            }
            let discard_reason = if mgr.is_terminal() {
                Some("instance is terminal")
            } else if !mgr
                .scheduled(task_id)
                .is_some_and(|s| state_helpers::completion_matches(s, &completion))
            {
                Some("no matching schedule")
            } else if mgr.is_completed(task_id) {
                Some("duplicate completion")
            } else {
                None
            };
            if let Some(reason) = discard_reason {
                debug!(
                    target: "durable_workflow::runtime",
                    instance_id = %instance,
                    task_id,
                    event = completion.type_name(),
                    reason,
                    "discarding completion"
                );
                return Ok(CompletionOutcome::Discarded);
            }

            let event = Event::new(mgr.next_event_id(), now_ms(), completion.clone());
            match self.store.append_events(instance, mgr.version(), vec![event]).await {
                Ok(_) => return Ok(CompletionOutcome::Applied),
                Err(e) => {
                    if !self.should_retry(instance, "append_events", &e, &mut attempts).await {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Record an activity result and run the instance forward.
    ///
    /// Returns `Applied` once the completion is persisted, even if the turn
    /// that follows fails; that failure is logged.
    pub async fn complete_task(
        self: &Arc<Self>,
        instance: &str,
        task_id: u64,
        result: Result<String, String>,
        attempt: u32,
    ) -> Result<CompletionOutcome, WorkflowError> {
        let completion = match result {
            Ok(output) => EventKind::TaskCompleted { task_id, output },
            Err(error) => EventKind::TaskFailed { task_id, error },
        };
        let outcome = self.record_completion(instance, completion).await?;
        debug!(
            target: "durable_workflow::runtime",
            instance_id = %instance,
            task_id,
            attempt,
            outcome = ?outcome,
            "task completion received"
        );
        if outcome == CompletionOutcome::Applied {
            // the completion is durable; a later turn picks it up if this one fails
            if let Err(e) = self.process_instance(instance).await {
                warn!(
                    target: "durable_workflow::runtime",
                    instance_id = %instance,
                    task_id,
                    error = %e,
                    "completion recorded but the follow-up turn failed"
                );
            }
        }
        Ok(outcome)
    }

    /// Terminate a non-terminal instance. Returns false if it had already finished.
    pub async fn terminate(&self, instance: &str, reason: &str) -> Result<bool, WorkflowError> {
        let guard = self.lock_instance(instance).await;
        let mut attempts = 0;
        let parent = loop {
            let history = self.read_history(instance).await?;
            let mgr = HistoryManager::from_history(&history);
            if !mgr.exists() {
                return Err(WorkflowError::InstanceNotFound(instance.to_string()));
            }
            if mgr.is_terminal() {
                return Ok(false);
            }
            let event = Event::new(
                mgr.next_event_id(),
                now_ms(),
                EventKind::ExecutionTerminated {
                    reason: reason.to_string(),
                },
            );
            match self.store.append_events(instance, mgr.version(), vec![event]).await {
                Ok(_) => break mgr.parent,
                Err(e) => {
                    if !self.should_retry(instance, "append_events", &e, &mut attempts).await {
                        return Err(e.into());
                    }
                }
            }
        };
        drop(guard);

        let aborted = self.in_flight_guard().remove(instance).unwrap_or_default();
        for handle in aborted.values() {
            handle.abort();
        }
        self.metrics.record_workflow_termination();
        self.status_changed.notify_waiters();
        info!(
            target: "durable_workflow::runtime",
            instance_id = %instance,
            reason = %reason,
            aborted_activities = aborted.len(),
            "instance terminated"
        );
        if let Some(parent) = parent {
            self.notify_parent(parent, instance, Err(format!("terminated: {reason}")));
        }
        Ok(true)
    }

    pub async fn get_status(&self, instance: &str) -> Result<WorkflowInstance, WorkflowError> {
        let history = self.read_history(instance).await?;
        HistoryManager::from_history(&history)
            .to_instance(instance)
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance.to_string()))
    }

    pub async fn read_events(&self, instance: &str) -> Result<Vec<Event>, WorkflowError> {
        self.read_history(instance).await
    }

    /// Activities scheduled for `instance` that have no completion yet.
    pub async fn pending_tasks(&self, instance: &str) -> Result<Vec<ActivityTask>, WorkflowError> {
        let history = self.read_history(instance).await?;
        let mgr = HistoryManager::from_history(&history);
        if !mgr.exists() {
            return Err(WorkflowError::InstanceNotFound(instance.to_string()));
        }
        if mgr.is_terminal() {
            return Ok(Vec::new());
        }
        Ok(mgr
            .outstanding()
            .filter_map(|kind| match kind {
                EventKind::TaskScheduled { task_id, name, input } => Some(ActivityTask {
                    instance_id: instance.to_string(),
                    task_id: *task_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect())
    }
}
