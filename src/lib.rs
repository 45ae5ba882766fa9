//! Durable workflow orchestration with deterministic replay.
//!
//! Workflow code is an ordinary `async` function over a [`WorkflowContext`].
//! Every call that reaches outside the workflow (activities, child workflows,
//! timers) is recorded as an [`Event`] in an append-only per-instance
//! history. Each time something new lands in that history the runtime
//! re-runs the workflow function from the top against the full history:
//! already-recorded calls resolve immediately from their recorded results,
//! and the first call whose result is still missing suspends the turn.
//!
//! - Public data model: [`Event`], [`EventKind`], [`Action`]
//! - Execution context: [`WorkflowContext`] with [`DurableFuture`] handles and
//!   deterministic fan-in through [`WorkflowContext::join`]
//! - Engine: [`runtime::Runtime`]; client: [`Client`]; storage:
//!   [`providers::HistoryStore`]
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod errors;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use client::Client;
pub use errors::WorkflowError;
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, TaskKind};
pub use logging::{LogLevel, LogRecord, ReplaySafeLogger};
pub use runtime::registry::{ActivityRegistry, WorkflowRegistry};
pub use runtime::{
    ActivityContext, ActivityHandler, CompletionOutcome, ProcessOutcome, RetryPolicy, Runtime, RuntimeOptions,
    RuntimeStatus, WorkflowHandler, WorkflowInstance,
};

use crate::_typed_codec::Codec;

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // A JSON string value is stored as its raw content
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Link from a child instance back to the task in its parent that awaits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParentLink {
    pub instance_id: String,
    pub task_id: u64,
}

/// One entry of an instance's append-only history.
///
/// `event_id` is the per-instance sequence number: the first event is 1 and
/// each append continues the sequence without gaps. The history length is
/// therefore also the instance's version for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: u64,
    /// Wall-clock append time. Workflow code never reads it directly.
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp_ms,
            kind,
        }
    }

    pub fn task_id(&self) -> Option<u64> {
        self.kind.task_id()
    }
}

/// History event payloads. Scheduling events and their completions are
/// correlated by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// A turn of workflow code began. Its timestamp is the deterministic
    /// "current time" for code first reached in that turn.
    OrchestratorStarted,
    /// The instance was created with a workflow type and input.
    ExecutionStarted {
        name: String,
        input: String,
        parent: Option<ParentLink>,
    },
    TaskScheduled {
        task_id: u64,
        name: String,
        input: String,
    },
    TaskCompleted {
        task_id: u64,
        output: String,
    },
    /// Terminal activity failure after the dispatcher exhausted its retries.
    TaskFailed {
        task_id: u64,
        error: String,
    },
    SubOrchestrationCreated {
        task_id: u64,
        instance_id: String,
        name: String,
        input: String,
    },
    SubOrchestrationCompleted {
        task_id: u64,
        instance_id: String,
        output: String,
    },
    SubOrchestrationFailed {
        task_id: u64,
        instance_id: String,
        error: String,
    },
    TimerCreated {
        task_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        task_id: u64,
        fire_at_ms: u64,
    },
    /// The instance was terminated from outside; replay short-circuits.
    ExecutionTerminated {
        reason: String,
    },
    /// Workflow code returned: `Ok(output)` or `Err(error)`.
    ExecutionCompleted {
        result: Result<String, String>,
    },
}

impl EventKind {
    pub fn task_id(&self) -> Option<u64> {
        match self {
            EventKind::TaskScheduled { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::SubOrchestrationCreated { task_id, .. }
            | EventKind::SubOrchestrationCompleted { task_id, .. }
            | EventKind::SubOrchestrationFailed { task_id, .. }
            | EventKind::TimerCreated { task_id, .. }
            | EventKind::TimerFired { task_id, .. } => Some(*task_id),
            EventKind::OrchestratorStarted
            | EventKind::ExecutionStarted { .. }
            | EventKind::ExecutionTerminated { .. }
            | EventKind::ExecutionCompleted { .. } => None,
        }
    }

    /// Events written by a turn of workflow code, as opposed to events that
    /// arrive from outside (start, completions, termination).
    pub fn is_turn_authored(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestratorStarted
                | EventKind::TaskScheduled { .. }
                | EventKind::SubOrchestrationCreated { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::ExecutionCompleted { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted { .. } | EventKind::ExecutionTerminated { .. }
        )
    }

    pub fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::TaskScheduled { .. } | EventKind::SubOrchestrationCreated { .. } | EventKind::TimerCreated { .. }
        )
    }

    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            EventKind::TaskCompleted { .. }
                | EventKind::TaskFailed { .. }
                | EventKind::SubOrchestrationCompleted { .. }
                | EventKind::SubOrchestrationFailed { .. }
                | EventKind::TimerFired { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted => "OrchestratorStarted",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::SubOrchestrationCreated { .. } => "SubOrchestrationCreated",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
        }
    }
}

/// Decisions produced by a turn. The runtime persists the matching
/// scheduling events first and dispatches the work afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        task_id: u64,
        name: String,
        input: String,
    },
    StartChildWorkflow {
        task_id: u64,
        name: String,
        instance_id: String,
        input: String,
    },
    CreateTimer {
        task_id: u64,
        fire_at_ms: u64,
    },
}

impl Action {
    pub fn task_id(&self) -> u64 {
        match self {
            Action::CallActivity { task_id, .. }
            | Action::StartChildWorkflow { task_id, .. }
            | Action::CreateTimer { task_id, .. } => *task_id,
        }
    }

    /// The scheduling event that records this decision.
    pub fn to_event_kind(&self) -> EventKind {
        match self.clone() {
            Action::CallActivity { task_id, name, input } => EventKind::TaskScheduled { task_id, name, input },
            Action::StartChildWorkflow {
                task_id,
                name,
                instance_id,
                input,
            } => EventKind::SubOrchestrationCreated {
                task_id,
                instance_id,
                name,
                input,
            },
            Action::CreateTimer { task_id, fire_at_ms } => EventKind::TimerCreated { task_id, fire_at_ms },
        }
    }

    /// Whether a replayed call agrees with the scheduling event recorded for its task id.
    fn matches_recorded(&self, recorded: &EventKind) -> bool {
        match (self, recorded) {
            (
                Action::CallActivity { name, input, .. },
                EventKind::TaskScheduled {
                    name: rn, input: ri, ..
                },
            ) => name == rn && input == ri,
            (
                Action::StartChildWorkflow {
                    name,
                    instance_id,
                    input,
                    ..
                },
                EventKind::SubOrchestrationCreated {
                    name: rn,
                    instance_id: rid,
                    input: ri,
                    ..
                },
            ) => name == rn && instance_id == rid && input == ri,
            (Action::CreateTimer { .. }, EventKind::TimerCreated { .. }) => true,
            _ => false,
        }
    }
}

/// Length of the history prefix already observed by some earlier turn:
/// everything up to and including the last turn-authored event.
pub(crate) fn observed_prefix_len(history: &[Event]) -> usize {
    history
        .iter()
        .rposition(|e| e.kind.is_turn_authored())
        .map(|idx| idx + 1)
        .unwrap_or(0)
}

#[derive(Debug)]
struct CtxInner {
    instance_id: String,
    workflow_name: String,
    input: String,

    // task_id -> scheduling event recorded by an earlier turn
    recorded_schedules: HashMap<u64, EventKind>,
    // task_id -> (history index, result)
    completions: HashMap<u64, (usize, DurableOutput)>,
    // (history index, timestamp) of every OrchestratorStarted
    turn_starts: Vec<(usize, u64)>,
    observed_len: usize,
    turn_started_ms: u64,

    next_task_id: u64,
    actions: Vec<Action>,
    replaying: bool,
    current_time_ms: u64,
    nondeterminism: Option<String>,
    log_buffer: Vec<LogRecord>,
}

impl CtxInner {
    fn new(instance_id: String, history: &[Event], turn_started_ms: u64) -> Self {
        let mut workflow_name = String::new();
        let mut input = String::new();
        let mut recorded_schedules = HashMap::new();
        let mut completions = HashMap::new();
        let mut turn_starts = Vec::new();

        for (idx, event) in history.iter().enumerate() {
            let resolved = match &event.kind {
                EventKind::ExecutionStarted { name, input: i, .. } => {
                    workflow_name = name.clone();
                    input = i.clone();
                    None
                }
                EventKind::OrchestratorStarted => {
                    turn_starts.push((idx, event.timestamp_ms));
                    None
                }
                kind @ (EventKind::TaskScheduled { task_id, .. }
                | EventKind::SubOrchestrationCreated { task_id, .. }
                | EventKind::TimerCreated { task_id, .. }) => {
                    recorded_schedules.insert(*task_id, kind.clone());
                    None
                }
                EventKind::TaskCompleted { task_id, output } => {
                    Some((*task_id, DurableOutput::Activity(Ok(output.clone()))))
                }
                EventKind::TaskFailed { task_id, error } => Some((*task_id, DurableOutput::Activity(Err(error.clone())))),
                EventKind::SubOrchestrationCompleted { task_id, output, .. } => {
                    Some((*task_id, DurableOutput::SubOrchestration(Ok(output.clone()))))
                }
                EventKind::SubOrchestrationFailed { task_id, error, .. } => {
                    Some((*task_id, DurableOutput::SubOrchestration(Err(error.clone()))))
                }
                EventKind::TimerFired { task_id, .. } => Some((*task_id, DurableOutput::Timer)),
                EventKind::ExecutionTerminated { .. } | EventKind::ExecutionCompleted { .. } => None,
            };
            if let Some((task_id, output)) = resolved {
                // First completion wins; stores reject duplicates anyway
                completions.entry(task_id).or_insert((idx, output));
            }
        }

        let current_time_ms = turn_starts.first().map(|(_, ts)| *ts).unwrap_or(turn_started_ms);
        Self {
            instance_id,
            workflow_name,
            input,
            recorded_schedules,
            completions,
            replaying: !turn_starts.is_empty(),
            turn_starts,
            observed_len: observed_prefix_len(history),
            turn_started_ms,
            next_task_id: 1,
            actions: Vec::new(),
            current_time_ms,
            nondeterminism: None,
            log_buffer: Vec::new(),
        }
    }

    fn schedule_with(&mut self, make: impl FnOnce(u64) -> Action) -> u64 {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let action = make(task_id);
        match self.recorded_schedules.get(&task_id) {
            Some(recorded) => {
                if !action.matches_recorded(recorded) && self.nondeterminism.is_none() {
                    self.nondeterminism = Some(format!(
                        "task {task_id}: code scheduled {:?} but history recorded {}",
                        action.to_event_kind(),
                        recorded.type_name()
                    ));
                }
            }
            None => {
                self.replaying = false;
                self.actions.push(action);
            }
        }
        task_id
    }

    fn resolve(&mut self, task_id: u64) -> Option<DurableOutput> {
        if self.nondeterminism.is_some() {
            return None;
        }
        let (idx, output) = self.completions.get(&task_id).cloned()?;
        if idx >= self.observed_len {
            self.replaying = false;
        }
        let reached_at = self
            .turn_starts
            .iter()
            .find(|(start_idx, _)| *start_idx > idx)
            .map(|(_, ts)| *ts)
            .unwrap_or(self.turn_started_ms);
        self.current_time_ms = self.current_time_ms.max(reached_at);
        Some(output)
    }

    /// Recorded schedules the code never reached again on completion.
    fn check_unreplayed_schedules(&mut self) {
        if self.nondeterminism.is_some() {
            return;
        }
        let mut missing: Vec<u64> = self
            .recorded_schedules
            .keys()
            .copied()
            .filter(|id| *id >= self.next_task_id)
            .collect();
        missing.sort_unstable();
        if let Some(first) = missing.first() {
            self.nondeterminism = Some(format!(
                "workflow returned without scheduling recorded task {first} ({} unreplayed)",
                missing.len()
            ));
        }
    }
}

/// User-facing workflow context for scheduling durable work and replay-safe helpers.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    /// Build a context over `history` for a turn starting at `turn_started_ms`.
    pub fn new(instance_id: impl Into<String>, history: &[Event], turn_started_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), history, turn_started_ms))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // Workflow panics are caught by the replay engine; keep the state usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn workflow_name(&self) -> String {
        self.lock().workflow_name.clone()
    }

    pub fn get_input(&self) -> String {
        self.lock().input.clone()
    }

    pub fn get_input_typed<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        _typed_codec::Json::decode(&self.get_input())
    }

    /// Deterministic current time: the start of the turn in which the code
    /// reached its current position for the first time.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().current_time_ms
    }

    /// `true` while the code is re-executing a stretch an earlier turn already ran.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let (name, input) = (name.into(), input.into());
        let task_id = self
            .lock()
            .schedule_with(|task_id| Action::CallActivity { task_id, name, input });
        DurableFuture::new(task_id, TaskKind::Activity, self.clone())
    }

    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Start a child workflow. Without an explicit `child_id` the child gets the
    /// deterministic ID `"{parent}::{task_id}"`.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        child_id: Option<String>,
    ) -> DurableFuture {
        let (name, input) = (name.into(), input.into());
        let mut inner = self.lock();
        let parent = inner.instance_id.clone();
        let task_id = inner.schedule_with(|task_id| Action::StartChildWorkflow {
            task_id,
            name,
            instance_id: child_id.unwrap_or_else(|| format!("{parent}::{task_id}")),
            input,
        });
        drop(inner);
        DurableFuture::new(task_id, TaskKind::SubOrchestration, self.clone())
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
        child_id: Option<String>,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.schedule_sub_orchestration(name, payload, child_id))
    }

    /// Durable timer firing at an absolute time in ms since the epoch.
    pub fn create_timer(&self, fire_at_ms: u64) -> DurableFuture {
        let task_id = self
            .lock()
            .schedule_with(|task_id| Action::CreateTimer { task_id, fire_at_ms });
        DurableFuture::new(task_id, TaskKind::Timer, self.clone())
    }

    /// Durable timer firing `delay` after [`current_time_ms`](Self::current_time_ms).
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let fire_at_ms = self.current_time_ms().saturating_add(delay.as_millis() as u64);
        self.create_timer(fire_at_ms)
    }

    /// Fan-in over a batch of handles. Outputs come back in scheduling order
    /// (ascending task id) no matter which completion arrived first.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub fn replay_safe_logger(&self, category: impl Into<String>) -> ReplaySafeLogger {
        ReplaySafeLogger::new(category.into(), self.clone())
    }

    /// Buffer a log line for this turn if it belongs to newly observed progress.
    pub fn log(&self, level: LogLevel, newly_observed: bool, message: impl Into<String>) {
        let mut inner = self.lock();
        let category = inner.workflow_name.clone();
        push_log(&mut inner, level, newly_observed, category, message.into());
    }

    pub(crate) fn log_with_category(&self, level: LogLevel, newly_observed: bool, category: &str, message: String) {
        let mut inner = self.lock();
        push_log(&mut inner, level, newly_observed, category.to_string(), message);
    }

    pub(crate) fn poll_task(&self, task_id: u64) -> Poll<DurableOutput> {
        match self.lock().resolve(task_id) {
            Some(output) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

fn push_log(inner: &mut CtxInner, level: LogLevel, newly_observed: bool, category: String, message: String) {
    if newly_observed {
        inner.log_buffer.push(LogRecord {
            level,
            category,
            message,
        });
    }
}

/// Everything one turn of workflow code produced.
#[derive(Debug)]
pub struct TurnOutput {
    /// `Some` when the workflow function returned during this turn.
    pub result: Option<Result<String, String>>,
    pub actions: Vec<Action>,
    pub logs: Vec<LogRecord>,
    pub nondeterminism: Option<String>,
}

/// Poll the workflow future once against the context's history.
///
/// All awaits inside workflow code resolve synchronously from history, so a
/// single poll either finishes the function or leaves it parked on the first
/// unresolved handle.
pub fn run_turn<F>(ctx: &WorkflowContext, workflow: F) -> TurnOutput
where
    F: Future<Output = Result<String, String>>,
{
    let mut fut = std::pin::pin!(workflow);
    let mut cx = Context::from_waker(Waker::noop());
    let polled = fut.as_mut().poll(&mut cx);

    let mut inner = ctx.lock();
    let result = match polled {
        Poll::Ready(out) => {
            inner.check_unreplayed_schedules();
            Some(out)
        }
        Poll::Pending => None,
    };
    TurnOutput {
        result,
        actions: std::mem::take(&mut inner.actions),
        logs: std::mem::take(&mut inner.log_buffer),
        nondeterminism: inner.nondeterminism.clone(),
    }
}
