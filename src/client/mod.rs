use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::_typed_codec::{Codec, Json};
use crate::runtime::{Runtime, RuntimeStatus, WorkflowInstance};
use crate::{Event, WorkflowError};

/// Thin client for control-plane operations.
///
/// Schedules instances and observes them through the history the runtime
/// persists; waits wake on the runtime's status-change notification and fall
/// back to polling every `client_poll_interval`.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Create an instance of `workflow_type`. Fails with `DuplicateInstance`
    /// if `instance_id` already has history.
    pub async fn schedule_new_instance(
        &self,
        workflow_type: &str,
        instance_id: &str,
        input: impl Into<String>,
    ) -> Result<String, WorkflowError> {
        self.runtime.schedule(workflow_type, instance_id, &input.into()).await?;
        Ok(instance_id.to_string())
    }

    /// Like [`Client::schedule_new_instance`] with a generated instance ID.
    pub async fn schedule_new_instance_auto(
        &self,
        workflow_type: &str,
        input: impl Into<String>,
    ) -> Result<String, WorkflowError> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        self.schedule_new_instance(workflow_type, &instance_id, input).await
    }

    /// Schedule with typed input (serialized to JSON).
    pub async fn schedule_new_instance_typed<In: Serialize>(
        &self,
        workflow_type: &str,
        instance_id: &str,
        input: &In,
    ) -> Result<String, WorkflowError> {
        let payload = Json::encode(input).map_err(WorkflowError::Codec)?;
        self.schedule_new_instance(workflow_type, instance_id, payload).await
    }

    /// Block until the instance leaves Pending. A missing instance counts as
    /// not started yet.
    pub async fn wait_for_start(&self, instance_id: &str, timeout: Duration) -> Result<WorkflowInstance, WorkflowError> {
        self.wait_until(instance_id, timeout, |s| !matches!(s, RuntimeStatus::Pending))
            .await
    }

    /// Block until the instance reaches Completed, Failed or Terminated.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowInstance, WorkflowError> {
        self.wait_until(instance_id, timeout, RuntimeStatus::is_terminal).await
    }

    /// Wait for completion and decode the output; Failed and Terminated
    /// instances come back as `WorkflowFailed`.
    pub async fn wait_for_completion_typed<Out: DeserializeOwned>(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<Out, WorkflowError> {
        let output = self.wait_for_completion(instance_id, timeout).await?.into_result()?;
        Json::decode(&output).map_err(WorkflowError::Codec)
    }

    async fn wait_until(
        &self,
        instance_id: &str,
        timeout: Duration,
        done: impl Fn(&RuntimeStatus) -> bool,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let poll = self.runtime.options().client_poll_interval;
        let wait = async {
            loop {
                // Register before reading so a change between the read and
                // the await is not missed.
                let notified = self.runtime.status_changed().notified();
                match self.runtime.get_status(instance_id).await {
                    Ok(instance) if done(&instance.status) => return Ok(instance),
                    Ok(_) | Err(WorkflowError::InstanceNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => {
                debug!(target: "durable_workflow::client", instance_id = %instance_id, ?timeout, "wait timed out");
                Err(WorkflowError::Timeout(instance_id.to_string()))
            }
        }
    }

    /// Non-blocking status snapshot.
    pub async fn get_status(&self, instance_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        self.runtime.get_status(instance_id).await
    }

    /// Terminate a running instance. Returns false if it had already finished.
    pub async fn terminate_instance(&self, instance_id: &str, reason: &str) -> Result<bool, WorkflowError> {
        self.runtime.terminate(instance_id, reason).await
    }

    pub async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, WorkflowError> {
        self.runtime.read_events(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;
    use crate::{ActivityRegistry, WorkflowContext, WorkflowRegistry};

    async fn runtime_with_echo() -> Arc<Runtime> {
        let workflows = WorkflowRegistry::builder()
            .register("Echo", |_ctx: WorkflowContext, input: String| async move { Ok(input) })
            .register("Park", |ctx: WorkflowContext, _input: String| async move {
                ctx.schedule_timer(Duration::from_secs(3600)).into_timer().await;
                Ok(String::new())
            })
            .build();
        Runtime::start(
            Arc::new(InMemoryHistoryStore::new()),
            ActivityRegistry::default(),
            workflows,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn waits_for_completion_and_rejects_duplicates() {
        let client = Client::new(runtime_with_echo().await);
        let id = client.schedule_new_instance("Echo", "e-1", "hello").await.unwrap();
        assert_eq!(id, "e-1");
        let done = client.wait_for_completion("e-1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, RuntimeStatus::Completed { output: "hello".into() });

        let dup = client.schedule_new_instance("Echo", "e-1", "again").await;
        assert_eq!(dup, Err(WorkflowError::DuplicateInstance("e-1".into())));
    }

    #[tokio::test]
    async fn wait_times_out_on_parked_instance() {
        let client = Client::new(runtime_with_echo().await);
        let id = client.schedule_new_instance_auto("Park", "").await.unwrap();
        let started = client.wait_for_start(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(started.status, RuntimeStatus::Running);
        let err = client
            .wait_for_completion(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, WorkflowError::Timeout(id));
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let client = Client::new(runtime_with_echo().await);
        client
            .schedule_new_instance_typed("Echo", "t-1", &serde_json::json!({"value": 5}))
            .await
            .unwrap();
        let out: serde_json::Value = client
            .wait_for_completion_typed("t-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out["value"], 5);
    }

    #[tokio::test]
    async fn missing_instance_waits_then_times_out() {
        let client = Client::new(runtime_with_echo().await);
        let err = client.wait_for_start("ghost", Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err, WorkflowError::Timeout("ghost".into()));
        assert!(matches!(
            client.get_status("ghost").await,
            Err(WorkflowError::InstanceNotFound(_))
        ));
    }
}
