//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Looks up activity implementations by name
//! - Runs attempts under a per-attempt deadline and the retry policy
//! - Bounds parallelism with a semaphore and reports terminal results back
//!   to the orchestrator dispatcher

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::super::{
    ActivityContext, ActivityRegistry, ActivityTask, OrchestratorMsg, RetryPolicy, Runtime, RuntimeMetrics,
};
use crate::WorkflowError;

/// Executes activities by name with retry and timeout policy.
pub struct ActivityDispatcher {
    activities: ActivityRegistry,
    default_policy: RetryPolicy,
    metrics: Arc<RuntimeMetrics>,
}

impl ActivityDispatcher {
    pub fn new(activities: ActivityRegistry, default_policy: RetryPolicy, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            activities,
            default_policy,
            metrics,
        }
    }

    /// Policy registered for `name`, else the runtime default.
    pub fn policy_for(&self, name: &str) -> RetryPolicy {
        self.activities
            .retry_policy(name)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Run a single attempt.
    pub async fn execute(&self, task: &ActivityTask, attempt: u32) -> Result<String, WorkflowError> {
        let handler = self
            .activities
            .get(&task.name)
            .ok_or_else(|| WorkflowError::UnknownActivity(task.name.clone()))?;
        let ctx = ActivityContext::new(task.instance_id.clone(), task.task_id, task.name.clone(), attempt);
        let fut = handler.invoke(ctx, task.input.clone());
        let limit = self.policy_for(&task.name).timeout;
        let result = tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| WorkflowError::TaskTimeout(limit))?;
        result.map_err(|error| WorkflowError::TaskFailed {
            task_id: task.task_id,
            error,
        })
    }

    /// Run attempts until success, a non-transient error, or the policy is
    /// exhausted. Returns the terminal result and the attempt it came from.
    pub async fn execute_with_retry(&self, task: &ActivityTask, worker_id: &str) -> (Result<String, String>, u32) {
        let policy = self.policy_for(&task.name);
        let max_attempts = policy.attempts();
        let mut attempt = 1;
        loop {
            debug!(
                target: "durable_workflow::activity",
                instance_id = %task.instance_id,
                task_id = task.task_id,
                activity_name = %task.name,
                attempt,
                worker = %worker_id,
                "Activity started"
            );
            let start_time = Instant::now();
            match self.execute(task, attempt).await {
                Ok(output) => {
                    self.metrics.record_activity_success();
                    debug!(
                        target: "durable_workflow::activity",
                        instance_id = %task.instance_id,
                        task_id = task.task_id,
                        activity_name = %task.name,
                        attempt,
                        worker = %worker_id,
                        outcome = "success",
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        "Activity completed"
                    );
                    return (Ok(output), attempt);
                }
                Err(err) => {
                    if matches!(err, WorkflowError::TaskTimeout(_)) {
                        self.metrics.record_activity_timeout();
                    }
                    if err.is_transient() && attempt < max_attempts {
                        let backoff = policy.backoff_for(attempt);
                        self.metrics.record_activity_retry();
                        warn!(
                            target: "durable_workflow::activity",
                            instance_id = %task.instance_id,
                            task_id = task.task_id,
                            activity_name = %task.name,
                            attempt,
                            worker = %worker_id,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "Activity attempt failed; retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    self.metrics.record_activity_failure();
                    warn!(
                        target: "durable_workflow::activity",
                        instance_id = %task.instance_id,
                        task_id = task.task_id,
                        activity_name = %task.name,
                        attempt,
                        worker = %worker_id,
                        outcome = "failed",
                        error = %err,
                        "Activity failed"
                    );
                    return (Err(err.to_string()), attempt);
                }
            }
        }
    }
}

impl Runtime {
    /// Spawn an execution for `task`, tracked so termination can abort it.
    pub(in crate::runtime) fn dispatch_activity(self: &Arc<Self>, task: ActivityTask) {
        let rt = Arc::clone(self);
        let instance = task.instance_id.clone();
        let task_id = task.task_id;
        let mut in_flight = self.in_flight_guard();
        let handle = tokio::spawn(async move { rt.run_activity(task).await });
        in_flight
            .entry(instance)
            .or_default()
            .insert(task_id, handle.abort_handle());
    }

    async fn run_activity(self: Arc<Self>, task: ActivityTask) {
        let Ok(permit) = Arc::clone(&self.worker_permits).acquire_owned().await else {
            self.forget_in_flight(&task);
            return;
        };
        let worker_id = format!("work-{}", self.runtime_id);
        let (result, attempt) = self.dispatcher.execute_with_retry(&task, &worker_id).await;
        drop(permit);
        self.forget_in_flight(&task);

        let _ = self.orchestrator_tx.send(OrchestratorMsg::TaskResult {
            instance: task.instance_id,
            task_id: task.task_id,
            result,
            attempt,
        });
    }

    fn forget_in_flight(&self, task: &ActivityTask) {
        let mut in_flight = self.in_flight_guard();
        if let Some(tasks) = in_flight.get_mut(&task.instance_id) {
            tasks.remove(&task.task_id);
            if tasks.is_empty() {
                in_flight.remove(&task.instance_id);
            }
        }
    }
}
