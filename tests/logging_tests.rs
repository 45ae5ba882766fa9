use durable_workflow::logging::WORKFLOW_LOG_TARGET;
use durable_workflow::{
    ActivityContext, ActivityRegistry, Client, Runtime, RuntimeStatus, WorkflowContext, WorkflowRegistry, durable_info,
    durable_warn,
};

mod common;
use common::WAIT;
use common::tracing_capture::install_tracing_capture;

fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Step", |_ctx: ActivityContext, input: String| async move { Ok(format!("did {input}")) })
        .build()
}

async fn chatty(ctx: WorkflowContext, _input: String) -> Result<String, String> {
    durable_info!(ctx, "workflow started");
    let mut done = Vec::new();
    for step in ["one", "two", "three"] {
        let out = ctx.schedule_activity("Step", step).into_activity().await?;
        durable_info!(ctx, "step finished: {out}");
        done.push(out);
    }
    let audit = ctx.replay_safe_logger("audit");
    audit.warn(format!("{} steps", done.len()));
    Ok(done.join(";"))
}

#[tokio::test]
async fn workflow_logs_are_emitted_once_across_replays() {
    let (captured, _guard) = install_tracing_capture();
    let workflows = WorkflowRegistry::builder().register("Chatty", chatty).build();
    let rt = Runtime::start(common::memory_store(), activities(), workflows).await.unwrap();
    let client = Client::new(rt.clone());

    client.schedule_new_instance("Chatty", "log-1", "").await.unwrap();
    let done = client.wait_for_completion("log-1", WAIT).await.unwrap();
    assert!(matches!(done.status, RuntimeStatus::Completed { .. }));

    let lines = captured.messages(WORKFLOW_LOG_TARGET);
    assert_eq!(
        lines,
        vec![
            "workflow started",
            "step finished: did one",
            "step finished: did two",
            "step finished: did three",
            "3 steps",
        ]
    );

    let events = captured.events();
    let audit = events
        .iter()
        .find(|e| e.target == WORKFLOW_LOG_TARGET && e.message == "3 steps")
        .unwrap();
    assert_eq!(audit.field("category").as_deref(), Some("audit"));
    assert_eq!(audit.field("instance_id").as_deref(), Some("log-1"));
    assert_eq!(audit.level, tracing::Level::WARN);

    let started = events
        .iter()
        .find(|e| e.target == WORKFLOW_LOG_TARGET && e.message == "workflow started")
        .unwrap();
    assert_eq!(started.field("category").as_deref(), Some("Chatty"));
    rt.shutdown().await;
}

#[tokio::test]
async fn activity_attempts_are_logged_with_context_fields() {
    let (captured, _guard) = install_tracing_capture();
    let workflows = WorkflowRegistry::builder()
        .register("Once", |ctx: WorkflowContext, _input: String| async move {
            let out = ctx.schedule_activity("Step", "solo").into_activity().await?;
            durable_warn!(ctx, "finished with {out}");
            Ok(out)
        })
        .build();
    let rt = Runtime::start(common::memory_store(), activities(), workflows).await.unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("Once", "log-2", "").await.unwrap();
    client.wait_for_completion("log-2", WAIT).await.unwrap();

    let completed: Vec<_> = captured
        .events()
        .into_iter()
        .filter(|e| e.target == "durable_workflow::activity" && e.message == "Activity completed")
        .collect();
    assert_eq!(completed.len(), 1);
    let line = &completed[0];
    assert_eq!(line.field("instance_id").as_deref(), Some("log-2"));
    assert_eq!(line.field("task_id").as_deref(), Some("1"));
    assert_eq!(line.field("activity_name").as_deref(), Some("Step"));
    assert_eq!(line.field("attempt").as_deref(), Some("1"));
    assert!(line.field("worker").is_some_and(|w| w.starts_with("work-")));

    assert_eq!(captured.count(WORKFLOW_LOG_TARGET, "finished with did solo"), 1);
    rt.shutdown().await;
}
