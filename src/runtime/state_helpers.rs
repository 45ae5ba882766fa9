use std::collections::{BTreeMap, HashSet};

use super::{RuntimeStatus, WorkflowInstance};
use crate::{Event, EventKind, ParentLink};

/// Derived view over one instance's history.
///
/// All instance state is computed from events; nothing here is authoritative.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    /// Workflow type (from ExecutionStarted)
    pub workflow_name: Option<String>,
    /// Original input (from ExecutionStarted)
    pub input: Option<String>,
    /// Set when this instance is a child workflow
    pub parent: Option<ParentLink>,
    /// Whether at least one turn has run
    pub has_started_turn: bool,
    /// Result recorded by ExecutionCompleted
    pub result: Option<Result<String, String>>,
    /// Reason recorded by ExecutionTerminated
    pub terminated: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,

    // task_id -> scheduling event
    scheduled: BTreeMap<u64, EventKind>,
    completed: HashSet<u64>,
    len: usize,
    observed_len: usize,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut mgr = Self {
            len: history.len(),
            observed_len: crate::observed_prefix_len(history),
            created_at_ms: history.first().map(|e| e.timestamp_ms).unwrap_or(0),
            updated_at_ms: history.last().map(|e| e.timestamp_ms).unwrap_or(0),
            ..Self::default()
        };

        for event in history {
            match &event.kind {
                EventKind::ExecutionStarted { name, input, parent } => {
                    mgr.workflow_name = Some(name.clone());
                    mgr.input = Some(input.clone());
                    mgr.parent = parent.clone();
                }
                EventKind::OrchestratorStarted => mgr.has_started_turn = true,
                kind @ (EventKind::TaskScheduled { task_id, .. }
                | EventKind::SubOrchestrationCreated { task_id, .. }
                | EventKind::TimerCreated { task_id, .. }) => {
                    mgr.scheduled.insert(*task_id, kind.clone());
                }
                EventKind::ExecutionCompleted { result } => {
                    // first terminal event wins
                    if !mgr.is_terminal() {
                        mgr.result = Some(result.clone());
                    }
                }
                EventKind::ExecutionTerminated { reason } => {
                    if !mgr.is_terminal() {
                        mgr.terminated = Some(reason.clone());
                    }
                }
                other => {
                    if let Some(task_id) = other.task_id() {
                        mgr.completed.insert(task_id);
                    }
                }
            }
        }
        mgr
    }

    pub fn exists(&self) -> bool {
        self.workflow_name.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_some() || self.terminated.is_some()
    }

    /// Current version for optimistic appends.
    pub fn version(&self) -> u64 {
        self.len as u64
    }

    pub fn next_event_id(&self) -> u64 {
        self.len as u64 + 1
    }

    /// Whether events arrived that no turn has seen yet.
    pub fn has_unobserved_events(&self) -> bool {
        self.observed_len < self.len
    }

    pub fn status(&self) -> RuntimeStatus {
        if let Some(reason) = &self.terminated {
            return RuntimeStatus::Terminated { reason: reason.clone() };
        }
        match &self.result {
            Some(Ok(output)) => RuntimeStatus::Completed { output: output.clone() },
            Some(Err(error)) => RuntimeStatus::Failed { error: error.clone() },
            None if self.has_started_turn => RuntimeStatus::Running,
            None => RuntimeStatus::Pending,
        }
    }

    /// The scheduling event recorded for `task_id`.
    pub fn scheduled(&self, task_id: u64) -> Option<&EventKind> {
        self.scheduled.get(&task_id)
    }

    pub fn is_completed(&self, task_id: u64) -> bool {
        self.completed.contains(&task_id)
    }

    /// Scheduling events without a completion, in task id order.
    pub fn outstanding(&self) -> impl Iterator<Item = &EventKind> {
        self.scheduled
            .iter()
            .filter(|(task_id, _)| !self.completed.contains(task_id))
            .map(|(_, kind)| kind)
    }

    pub fn to_instance(&self, instance_id: &str) -> Option<WorkflowInstance> {
        let workflow_name = self.workflow_name.clone()?;
        let status = self.status();
        let output = match &status {
            RuntimeStatus::Completed { output } => Some(output.clone()),
            RuntimeStatus::Failed { error } => Some(error.clone()),
            _ => None,
        };
        Some(WorkflowInstance {
            instance_id: instance_id.to_string(),
            workflow_name,
            status,
            input: self.input.clone().unwrap_or_default(),
            output,
            parent: self.parent.clone(),
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

/// Whether `completion` is the right kind of result for the recorded `schedule`.
pub(crate) fn completion_matches(schedule: &EventKind, completion: &EventKind) -> bool {
    match (schedule, completion) {
        (EventKind::TaskScheduled { .. }, EventKind::TaskCompleted { .. } | EventKind::TaskFailed { .. }) => true,
        (EventKind::TimerCreated { .. }, EventKind::TimerFired { .. }) => true,
        (
            EventKind::SubOrchestrationCreated { instance_id, .. },
            EventKind::SubOrchestrationCompleted { instance_id: child, .. }
            | EventKind::SubOrchestrationFailed { instance_id: child, .. },
        ) => instance_id == child,
        _ => false,
    }
}
