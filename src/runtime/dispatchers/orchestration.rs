//! Orchestration dispatcher implementation for Runtime
//!
//! Consumes orchestrator messages (process requests, activity results, fired
//! timers, child results) and applies the actions a turn produced once its
//! events are persisted.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::super::timers::TimerSchedule;
use super::super::{ActivityTask, CompletionOutcome, OrchestratorMsg, Runtime, RuntimeStatus};
use crate::{Action, EventKind, ParentLink, WorkflowError};

/// Result a terminal child reports to its parent.
pub(crate) fn child_result(status: &RuntimeStatus) -> Option<Result<String, String>> {
    match status {
        RuntimeStatus::Completed { output } => Some(Ok(output.clone())),
        RuntimeStatus::Failed { error } => Some(Err(error.clone())),
        RuntimeStatus::Terminated { reason } => Some(Err(format!("terminated: {reason}"))),
        RuntimeStatus::Pending | RuntimeStatus::Running => None,
    }
}

impl Runtime {
    /// Start the orchestration dispatcher. Each message runs on its own task
    /// in the runtime's handler set; per-instance locks keep turns of one
    /// instance sequential.
    pub(in crate::runtime) fn start_orchestration_dispatcher(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<OrchestratorMsg>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let rt = Arc::clone(&self);
                let mut handlers = self.orchestrator_tasks_guard();
                while let Some(done) = handlers.try_join_next() {
                    match done {
                        Err(e) if e.is_panic() => {
                            warn!(target: "durable_workflow::runtime", error = %e, "orchestrator message handler panicked");
                        }
                        _ => {}
                    }
                }
                handlers.spawn(async move { rt.handle_orchestrator_msg(msg).await });
                drop(handlers);
            }
            debug!(target: "durable_workflow::runtime", "orchestration dispatcher exited");
        })
    }

    async fn handle_orchestrator_msg(self: Arc<Self>, msg: OrchestratorMsg) {
        let (instance, res) = match msg {
            OrchestratorMsg::Process { instance } => {
                let res = self.process_instance(&instance).await.map(|_| ());
                (instance, res)
            }
            OrchestratorMsg::TaskResult {
                instance,
                task_id,
                result,
                attempt,
            } => {
                let res = self.complete_task(&instance, task_id, result, attempt).await.map(|_| ());
                (instance, res)
            }
            OrchestratorMsg::TimerFired {
                instance,
                task_id,
                fire_at_ms,
            } => {
                let res = self
                    .complete_and_process(&instance, EventKind::TimerFired { task_id, fire_at_ms })
                    .await;
                (instance, res)
            }
            OrchestratorMsg::ChildResult {
                parent,
                child_instance,
                result,
            } => {
                let completion = match result {
                    Ok(output) => EventKind::SubOrchestrationCompleted {
                        task_id: parent.task_id,
                        instance_id: child_instance,
                        output,
                    },
                    Err(error) => EventKind::SubOrchestrationFailed {
                        task_id: parent.task_id,
                        instance_id: child_instance,
                        error,
                    },
                };
                let res = self.complete_and_process(&parent.instance_id, completion).await;
                (parent.instance_id, res)
            }
        };
        if let Err(e) = res {
            warn!(target: "durable_workflow::runtime", instance_id = %instance, error = %e, "orchestrator message failed");
        }
    }

    async fn complete_and_process(self: &Arc<Self>, instance: &str, completion: EventKind) -> Result<(), WorkflowError> {
        if self.record_completion(instance, completion).await? == CompletionOutcome::Applied {
            self.process_instance(instance).await?;
        }
        Ok(())
    }

    /// Dispatch the work a persisted turn decided on.
    pub(in crate::runtime) async fn apply_actions(self: &Arc<Self>, instance: &str, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::CallActivity { task_id, name, input } => {
                    if self.options.auto_dispatch_activities {
                        self.dispatch_activity(ActivityTask {
                            instance_id: instance.to_string(),
                            task_id,
                            name,
                            input,
                        });
                    } else {
                        debug!(
                            target: "durable_workflow::runtime",
                            instance_id = %instance,
                            task_id,
                            activity_name = %name,
                            "activity recorded for external completion"
                        );
                    }
                }
                Action::CreateTimer { task_id, fire_at_ms } => self.arm_timer(instance, task_id, fire_at_ms),
                Action::StartChildWorkflow {
                    task_id,
                    name,
                    instance_id,
                    input,
                } => {
                    let parent = ParentLink {
                        instance_id: instance.to_string(),
                        task_id,
                    };
                    self.start_child(parent, &instance_id, &name, &input).await;
                }
            }
        }
    }

    pub(in crate::runtime) fn arm_timer(&self, instance: &str, task_id: u64, fire_at_ms: u64) {
        let _ = self.timer_tx.send(TimerSchedule {
            fire_at_ms,
            instance: instance.to_string(),
            task_id,
        });
    }

    /// Create the child instance, or re-link to it if it already exists for
    /// this parent task.
    pub(in crate::runtime) async fn start_child(&self, parent: ParentLink, child_id: &str, name: &str, input: &str) {
        let started = EventKind::ExecutionStarted {
            name: name.to_string(),
            input: input.to_string(),
            parent: Some(parent.clone()),
        };
        match self.create_instance(child_id, started).await {
            Ok(()) => {
                info!(
                    target: "durable_workflow::runtime",
                    instance_id = %child_id,
                    parent_instance = %parent.instance_id,
                    parent_task_id = parent.task_id,
                    workflow_name = %name,
                    "child workflow started"
                );
                self.enqueue_process(child_id);
            }
            Err(WorkflowError::DuplicateInstance(_)) => match self.get_status(child_id).await {
                Ok(existing) if existing.parent.as_ref() == Some(&parent) => match child_result(&existing.status) {
                    Some(result) => self.notify_parent(parent, child_id, result),
                    None => self.enqueue_process(child_id),
                },
                Ok(_) => {
                    warn!(
                        target: "durable_workflow::runtime",
                        instance_id = %child_id,
                        parent_instance = %parent.instance_id,
                        "child instance id already belongs to another instance"
                    );
                    let error = WorkflowError::DuplicateInstance(child_id.to_string()).to_string();
                    self.notify_parent(parent, child_id, Err(error));
                }
                Err(e) => {
                    warn!(target: "durable_workflow::runtime", instance_id = %child_id, error = %e, "child status read failed");
                }
            },
            Err(e) => {
                warn!(target: "durable_workflow::runtime", instance_id = %child_id, error = %e, "child creation failed");
                self.notify_parent(parent, child_id, Err(e.to_string()));
            }
        }
    }

    pub(in crate::runtime) fn notify_parent(&self, parent: ParentLink, child_instance: &str, result: Result<String, String>) {
        let _ = self.orchestrator_tx.send(OrchestratorMsg::ChildResult {
            parent,
            child_instance: child_instance.to_string(),
            result,
        });
    }
}
