use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::logging::LogRecord;
use crate::runtime::WorkflowHandler;
use crate::{Action, Event, EventKind, WorkflowContext, WorkflowError, run_turn};

/// Result of executing a workflow turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Workflow code is parked on an unresolved handle
    Continue,
    /// Workflow code returned output
    Completed(String),
    /// Workflow code returned an error, panicked or diverged from history
    Failed(String),
}

/// Replays history and executes one deterministic workflow turn
pub struct ReplayEngine {
    pub(crate) instance: String,
    /// History events generated during this run
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pub(crate) pending_actions: Vec<Action>,
    /// Replay-safe log lines to emit after persistence
    pub(crate) logs: Vec<LogRecord>,
    pub(crate) baseline_history: Vec<Event>,
    pub(crate) next_event_id: u64,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.len() as u64 + 1;
        Self {
            instance: instance.into(),
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            logs: Vec::new(),
            baseline_history,
            next_event_id,
        }
    }

    fn push(&mut self, now_ms: u64, kind: EventKind) {
        self.history_delta.push(Event::new(self.next_event_id, now_ms, kind));
        self.next_event_id += 1;
    }

    /// Run the workflow against the baseline plus a fresh `OrchestratorStarted`
    /// stamped `now_ms`, and stage the resulting events.
    pub fn execute_workflow(&mut self, handler: Arc<dyn WorkflowHandler>, input: String, now_ms: u64) -> TurnResult {
        self.push(now_ms, EventKind::OrchestratorStarted);
        // The context sees only persisted history; this turn's start is `now_ms`
        let ctx = WorkflowContext::new(self.instance.clone(), &self.baseline_history, now_ms);

        debug!(
            target: "durable_workflow::runtime",
            instance_id = %self.instance,
            history_len = self.baseline_history.len(),
            "executing workflow turn"
        );

        let turn = catch_unwind(AssertUnwindSafe(|| run_turn(&ctx, handler.invoke(ctx.clone(), input))));
        let turn = match turn {
            Ok(turn) => turn,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(target: "durable_workflow::runtime", instance_id = %self.instance, panic = %msg, "workflow panicked");
                return self.fail(format!("workflow panicked: {msg}"), now_ms);
            }
        };

        if let Some(detail) = turn.nondeterminism {
            warn!(target: "durable_workflow::runtime", instance_id = %self.instance, detail = %detail, "detected nondeterminism");
            return self.fail(WorkflowError::Nondeterminism(detail).to_string(), now_ms);
        }

        self.logs = turn.logs;
        for action in &turn.actions {
            self.push(now_ms, action.to_event_kind());
        }
        self.pending_actions = turn.actions;

        match turn.result {
            None => TurnResult::Continue,
            Some(Ok(output)) => {
                self.push(
                    now_ms,
                    EventKind::ExecutionCompleted {
                        result: Ok(output.clone()),
                    },
                );
                TurnResult::Completed(output)
            }
            Some(Err(error)) => {
                self.push(
                    now_ms,
                    EventKind::ExecutionCompleted {
                        result: Err(error.clone()),
                    },
                );
                TurnResult::Failed(error)
            }
        }
    }

    /// Stage a failed turn without running workflow code. Anything the turn
    /// produced so far except its `OrchestratorStarted` is dropped.
    pub fn fail(&mut self, error: String, now_ms: u64) -> TurnResult {
        self.history_delta.retain(|e| matches!(e.kind, EventKind::OrchestratorStarted));
        self.next_event_id = self.baseline_history.len() as u64 + self.history_delta.len() as u64 + 1;
        if self.history_delta.is_empty() {
            self.push(now_ms, EventKind::OrchestratorStarted);
        }
        self.pending_actions.clear();
        self.logs.clear();
        self.push(
            now_ms,
            EventKind::ExecutionCompleted {
                result: Err(error.clone()),
            },
        );
        TurnResult::Failed(error)
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
