use durable_workflow::runtime::RuntimeOptions;
use durable_workflow::{ActivityContext, ActivityRegistry, Client, Runtime, RuntimeStatus, WorkflowContext, WorkflowRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod common;
use common::WAIT;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_instances_run_side_by_side() {
    let workflows = WorkflowRegistry::builder()
        .register("Square", |ctx: WorkflowContext, input: String| async move {
            let batch = (0..3).map(|_| ctx.schedule_activity("Square", input.clone())).collect();
            let outs: Result<Vec<String>, String> = ctx.join(batch).await.into_iter().map(|o| o.into_result()).collect();
            Ok(outs?.join("+"))
        })
        .build();
    let activities = ActivityRegistry::builder()
        .register("Square", |_ctx: ActivityContext, input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("{e}"))?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok((n * n).to_string())
        })
        .build();
    let rt = Runtime::start(common::memory_store(), activities, workflows).await.unwrap();
    let client = Client::new(rt.clone());

    for i in 0..20 {
        client
            .schedule_new_instance("Square", &format!("sq-{i}"), i.to_string())
            .await
            .unwrap();
    }
    let waits = (0..20).map(|i| {
        let client = client.clone();
        async move { client.wait_for_completion(&format!("sq-{i}"), WAIT).await }
    });
    let results = futures::future::join_all(waits).await;

    for (i, res) in results.into_iter().enumerate() {
        let sq = (i * i).to_string();
        assert_eq!(
            res.unwrap().status,
            RuntimeStatus::Completed {
                output: format!("{sq}+{sq}+{sq}")
            }
        );
    }
    assert_eq!(rt.metrics_snapshot().workflow_completions, 20);
    assert_eq!(rt.metrics_snapshot().activity_success, 60);
    rt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_concurrency_bounds_parallel_activities() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let activities = ActivityRegistry::builder()
        .register("Busy", move |_ctx: ActivityContext, input: String| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Wide", |ctx: WorkflowContext, _input: String| async move {
            let batch = (0..8).map(|i| ctx.schedule_activity("Busy", i.to_string())).collect();
            Ok(ctx.join(batch).await.len().to_string())
        })
        .build();
    let opts = RuntimeOptions {
        worker_concurrency: 2,
        ..Default::default()
    };
    let rt = Runtime::start_with_options(common::memory_store(), activities, workflows, opts)
        .await
        .unwrap();
    let client = Client::new(rt.clone());
    client.schedule_new_instance("Wide", "wide", "").await.unwrap();
    let done = client.wait_for_completion("wide", WAIT).await.unwrap();
    assert_eq!(done.status, RuntimeStatus::Completed { output: "8".into() });
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
    rt.shutdown().await;
}
