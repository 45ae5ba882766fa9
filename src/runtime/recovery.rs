//! Startup recovery: re-arms work that a previous process recorded but never
//! saw through.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::dispatchers::child_result;
use super::{ActivityTask, HistoryManager, Runtime};
use crate::{EventKind, ParentLink, WorkflowError};

impl Runtime {
    /// Scan every stored instance and resume it.
    ///
    /// For each non-terminal instance, outstanding activities are dispatched
    /// again, outstanding timers re-armed and outstanding children re-linked;
    /// then a turn is queued so completions persisted before the crash are
    /// observed. Terminal children re-deliver their result to the parent,
    /// which discards it if it already has one. An instance whose history
    /// cannot be read is logged and skipped. Returns the number of instances
    /// resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, WorkflowError> {
        let instances = self.store.list_instances().await?;
        let mut resumed = 0;
        let mut skipped = 0;
        for instance in instances {
            let history = match self.read_history(&instance).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(
                        target: "durable_workflow::runtime",
                        instance_id = %instance,
                        error = %e,
                        "skipping unreadable instance during recovery"
                    );
                    skipped += 1;
                    continue;
                }
            };
            let mgr = HistoryManager::from_history(&history);
            if !mgr.exists() {
                continue;
            }
            if mgr.is_terminal() {
                if let (Some(parent), Some(result)) = (mgr.parent.clone(), child_result(&mgr.status())) {
                    self.notify_parent(parent, &instance, result);
                }
                continue;
            }

            let outstanding: Vec<EventKind> = mgr.outstanding().cloned().collect();
            debug!(
                target: "durable_workflow::runtime",
                instance_id = %instance,
                outstanding = outstanding.len(),
                "recovering instance"
            );
            for kind in outstanding {
                match kind {
                    EventKind::TaskScheduled { task_id, name, input } => {
                        if self.options.auto_dispatch_activities {
                            self.dispatch_activity(ActivityTask {
                                instance_id: instance.clone(),
                                task_id,
                                name,
                                input,
                            });
                        }
                    }
                    EventKind::TimerCreated { task_id, fire_at_ms } => self.arm_timer(&instance, task_id, fire_at_ms),
                    EventKind::SubOrchestrationCreated {
                        task_id,
                        name,
                        instance_id,
                        input,
                    } => {
                        let parent = ParentLink {
                            instance_id: instance.clone(),
                            task_id,
                        };
                        self.start_child(parent, &instance_id, &name, &input).await;
                    }
                    _ => {}
                }
            }
            self.enqueue_process(&instance);
            resumed += 1;
        }
        info!(target: "durable_workflow::runtime", resumed, skipped, "recovery complete");
        Ok(resumed)
    }
}
