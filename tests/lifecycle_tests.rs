use durable_workflow::runtime::RuntimeOptions;
use durable_workflow::{
    ActivityContext, ActivityRegistry, Client, CompletionOutcome, EventKind, ProcessOutcome, Runtime, RuntimeStatus,
    WorkflowContext, WorkflowError, WorkflowRegistry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod common;
use common::WAIT;

fn slow_activities(finished: Arc<AtomicBool>) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Slow", move |_ctx: ActivityContext, input: String| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(input)
            }
        })
        .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build()
}

fn workflows() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("Stuck", |ctx: WorkflowContext, input: String| async move {
            ctx.schedule_activity("Slow", input).into_activity().await
        })
        .register("Parent", |ctx: WorkflowContext, _input: String| async move {
            match ctx
                .schedule_sub_orchestration("Stuck", "c", Some("stuck-child".into()))
                .into_sub_orchestration()
                .await
            {
                Ok(out) => Ok(out),
                Err(e) => Ok(format!("child ended: {e}")),
            }
        })
        .register("EchoOnce", |ctx: WorkflowContext, input: String| async move {
            ctx.schedule_activity("Echo", input).into_activity().await
        })
        .register("Wait", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_millis(30)).into_timer().await;
            ctx.schedule_activity("Echo", "after timer").into_activity().await
        })
        .build()
}

#[tokio::test]
async fn terminate_stops_instance_and_discards_late_results() {
    let finished = Arc::new(AtomicBool::new(false));
    let rt = Runtime::start(common::memory_store(), slow_activities(finished.clone()), workflows())
        .await
        .unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("Stuck", "t-1", "v").await.unwrap();
    assert!(common::wait_for_history(rt.store(), "t-1", |h| common::count_scheduled(h, "Slow") == 1, 2_000).await);

    assert!(client.terminate_instance("t-1", "operator request").await.unwrap());
    let done = client.wait_for_completion("t-1", WAIT).await.unwrap();
    assert_eq!(
        done.status,
        RuntimeStatus::Terminated {
            reason: "operator request".into()
        }
    );
    assert!(matches!(done.into_result(), Err(WorkflowError::WorkflowFailed(m)) if m.contains("operator request")));

    // Second terminate is a no-op; a late result is dropped
    assert!(!client.terminate_instance("t-1", "again").await.unwrap());
    let late = rt.complete_task("t-1", 1, Ok("v".into()), 1).await.unwrap();
    assert_eq!(late, CompletionOutcome::Discarded);

    let hist = client.read_history("t-1").await.unwrap();
    assert_eq!(common::count_terminal(&hist), 1);
    assert!(!hist.iter().any(|e| matches!(e.kind, EventKind::TaskCompleted { .. })));
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(rt.metrics_snapshot().workflow_terminations, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminating_a_child_fails_the_parent_task() {
    let rt = Runtime::start(
        common::memory_store(),
        slow_activities(Arc::new(AtomicBool::new(false))),
        workflows(),
    )
    .await
    .unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("Parent", "p", "").await.unwrap();
    assert!(
        common::wait_for_history(rt.store(), "stuck-child", |h| common::count_scheduled(h, "Slow") == 1, 2_000)
            .await
    );

    client.terminate_instance("stuck-child", "cancelled").await.unwrap();
    let parent = client.wait_for_completion("p", WAIT).await.unwrap();
    assert_eq!(
        parent.status,
        RuntimeStatus::Completed {
            output: "child ended: terminated: cancelled".into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_unknown_instance_is_not_found() {
    let rt = Runtime::start(common::memory_store(), ActivityRegistry::default(), workflows())
        .await
        .unwrap();
    let err = Client::new(rt.clone())
        .terminate_instance("nobody", "x")
        .await
        .unwrap_err();
    assert_eq!(err, WorkflowError::InstanceNotFound("nobody".into()));
    rt.shutdown().await;
}

#[tokio::test]
async fn timer_fires_at_recorded_time_then_workflow_continues() {
    let rt = Runtime::start(
        common::memory_store(),
        slow_activities(Arc::new(AtomicBool::new(false))),
        workflows(),
    )
    .await
    .unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("Wait", "timer-1", "").await.unwrap();
    let done = client.wait_for_completion("timer-1", WAIT).await.unwrap();
    assert_eq!(done.status, RuntimeStatus::Completed { output: "after timer".into() });

    let hist = client.read_history("timer-1").await.unwrap();
    let created = hist.iter().find_map(|e| match e.kind {
        EventKind::TimerCreated { fire_at_ms, .. } => Some(fire_at_ms),
        _ => None,
    });
    let fired = hist.iter().find_map(|e| match e.kind {
        EventKind::TimerFired { fire_at_ms, .. } => Some((fire_at_ms, e.timestamp_ms)),
        _ => None,
    });
    let (fired_at, appended_at) = fired.unwrap();
    assert_eq!(Some(fired_at), created);
    assert!(appended_at >= fired_at);
    rt.shutdown().await;
}

#[tokio::test]
async fn instance_locks_are_released_once_instances_finish() {
    let rt = Runtime::start(common::memory_store(), slow_activities(Arc::default()), workflows())
        .await
        .unwrap();
    let client = Client::new(rt.clone());
    for i in 0..50 {
        client
            .schedule_new_instance("EchoOnce", &format!("lk-{i}"), i.to_string())
            .await
            .unwrap();
    }
    for i in 0..50 {
        let done = client.wait_for_completion(&format!("lk-{i}"), WAIT).await.unwrap();
        assert_eq!(done.status, RuntimeStatus::Completed { output: i.to_string() });
    }
    let drained = tokio::time::timeout(WAIT, async {
        while rt.locked_instances() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "{} locks still tracked", rt.locked_instances());
    rt.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_turns_that_have_not_been_persisted() {
    let inner = common::memory_store();
    let gated = Arc::new(common::fault_injection::GatedAppendStore::new(inner.clone()));
    let rt = Runtime::start(gated.clone(), slow_activities(Arc::default()), workflows())
        .await
        .unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("EchoOnce", "sd-1", "x").await.unwrap();

    let parked = tokio::time::timeout(WAIT, async {
        while gated.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(parked.is_ok());

    rt.shutdown().await;
    gated.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hist = inner.read_events("sd-1").await.unwrap();
    assert_eq!(hist.len(), 1, "{hist:?}");
}

#[tokio::test]
async fn completion_is_applied_even_if_the_next_turn_fails() {
    let inner = common::memory_store();
    let failing = Arc::new(common::fault_injection::FailingReadStore::new(inner.clone()));
    let opts = RuntimeOptions {
        auto_dispatch_activities: false,
        ..Default::default()
    };
    let rt = Runtime::start_with_options(failing.clone(), slow_activities(Arc::default()), workflows(), opts)
        .await
        .unwrap();
    rt.schedule("EchoOnce", "ap-1", "v").await.unwrap();
    assert!(common::wait_for_history(inner.clone(), "ap-1", |h| common::count_scheduled(h, "Echo") == 1, 2_000).await);

    // the completion intake read succeeds, the turn's read does not
    failing.fail_reads_after(1);
    let outcome = rt.complete_task("ap-1", 1, Ok("v".into()), 1).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Applied);
    failing.disarm();

    let hist = inner.read_events("ap-1").await.unwrap();
    assert!(
        hist.iter()
            .any(|e| matches!(&e.kind, EventKind::TaskCompleted { task_id: 1, output } if output == "v"))
    );
    assert_eq!(
        rt.process_instance("ap-1").await.unwrap(),
        ProcessOutcome::Completed { output: "v".into() }
    );
    rt.shutdown().await;
}
