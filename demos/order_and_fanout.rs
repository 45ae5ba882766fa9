//! Order processing and parent/child fan-out, driven through the client API.
//!
//! Run with `cargo run --example order_and_fanout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use durable_workflow::providers::in_memory::InMemoryHistoryStore;
use durable_workflow::runtime::observability::{ObservabilityConfig, init_logging};
use durable_workflow::{
    ActivityContext, ActivityRegistry, Client, Runtime, WorkflowContext, WorkflowRegistry, durable_info,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPayload {
    name: String,
    total_cost: f64,
    quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryResult {
    success: bool,
    in_stock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderResult {
    processed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FanoutPayload {
    value: u32,
}

const APPROVAL_THRESHOLD: f64 = 5_000.0;

type Inventory = Arc<Mutex<HashMap<String, u32>>>;

async fn order_processing(ctx: WorkflowContext, order: OrderPayload) -> Result<OrderResult, String> {
    let order_id = ctx.instance_id();
    let notify = |message: String| ctx.schedule_activity("Notify", message).into_activity();

    notify(format!(
        "Received order {order_id} for {} {} at ${}",
        order.quantity, order.name, order.total_cost
    ))
    .await?;

    let inventory: InventoryResult = ctx
        .schedule_activity_typed("VerifyInventory", &order)?
        .into_activity_typed()
        .await?;
    if !inventory.success {
        notify(format!("Insufficient inventory for {}", order.name)).await?;
        return Ok(OrderResult { processed: false });
    }

    if order.total_cost > APPROVAL_THRESHOLD {
        durable_info!(ctx, "order {order_id} needs approval");
        ctx.schedule_activity_typed("RequestApproval", &order)?
            .into_activity()
            .await?;
    }

    ctx.schedule_activity_typed("ProcessPayment", &order)?
        .into_activity()
        .await?;

    if let Err(e) = ctx
        .schedule_activity_typed("UpdateInventory", &order)?
        .into_activity()
        .await
    {
        notify(format!("Order {order_id} failed: {e}")).await?;
        return Ok(OrderResult { processed: false });
    }

    notify(format!("Order {order_id} has completed")).await?;
    Ok(OrderResult { processed: true })
}

async fn fanout(ctx: WorkflowContext, input: FanoutPayload) -> Result<FanoutPayload, String> {
    durable_info!(ctx, "fanout starting with {}", input.value);
    let child: FanoutPayload = ctx
        .schedule_sub_orchestration_typed("FanoutChildWorkflow", &input, None)?
        .into_sub_orchestration_typed()
        .await?;
    durable_info!(ctx, "child workflow returned {}", child.value);
    Ok(FanoutPayload { value: input.value + 1 })
}

async fn fanout_child(ctx: WorkflowContext, input: FanoutPayload) -> Result<FanoutPayload, String> {
    let mut batch = Vec::new();
    for i in 0..input.value {
        batch.push(ctx.schedule_activity_typed("FanoutActivity", &FanoutPayload { value: i })?);
    }
    let log = ctx.replay_safe_logger("FanoutChildWorkflow");
    for out in ctx.join(batch).await {
        log.info(format!("activity returned {}", out.into_result()?));
    }
    Ok(FanoutPayload { value: input.value + 1 })
}

fn activities(inventory: Inventory) -> ActivityRegistry {
    let verify_stock = inventory.clone();
    ActivityRegistry::builder()
        .register("Notify", |ctx: ActivityContext, message: String| async move {
            tracing::info!(instance_id = %ctx.instance_id(), "{message}");
            Ok(String::new())
        })
        .register_typed("VerifyInventory", move |_ctx: ActivityContext, order: OrderPayload| {
            let stock = verify_stock.clone();
            async move {
                let in_stock = stock
                    .lock()
                    .map_err(|e| e.to_string())?
                    .get(&order.name)
                    .copied()
                    .unwrap_or(0);
                Ok(InventoryResult {
                    success: in_stock >= order.quantity,
                    in_stock,
                })
            }
        })
        .register_typed("RequestApproval", |ctx: ActivityContext, order: OrderPayload| async move {
            tracing::info!(instance_id = %ctx.instance_id(), cost = order.total_cost, "approval requested");
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(true)
        })
        .register_typed("ProcessPayment", |ctx: ActivityContext, order: OrderPayload| async move {
            tracing::info!(instance_id = %ctx.instance_id(), cost = order.total_cost, "processing payment");
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .register_typed("UpdateInventory", move |_ctx: ActivityContext, order: OrderPayload| {
            let stock = inventory.clone();
            async move {
                let mut stock = stock.lock().map_err(|e| e.to_string())?;
                let remaining = stock.get(&order.name).copied().unwrap_or(0);
                if remaining < order.quantity {
                    return Err(format!("only {remaining} {} left", order.name));
                }
                stock.insert(order.name.clone(), remaining - order.quantity);
                Ok(remaining - order.quantity)
            }
        })
        .register_typed("FanoutActivity", |_ctx: ActivityContext, input: FanoutPayload| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(input.value) * 50)).await;
            Ok(FanoutPayload { value: input.value + 1 })
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&ObservabilityConfig::default())?;

    let inventory: Inventory = Arc::new(Mutex::new(HashMap::from([("Cars".to_string(), 10)])));
    let workflows = WorkflowRegistry::builder()
        .register_typed("OrderProcessingWorkflow", order_processing)
        .register_typed("FanoutWorkflow", fanout)
        .register_typed("FanoutChildWorkflow", fanout_child)
        .build();
    let rt = Runtime::start(Arc::new(InMemoryHistoryStore::new()), activities(inventory), workflows).await?;
    let client = Client::new(rt.clone());

    let order = OrderPayload {
        name: "Cars".into(),
        total_cost: 5_000.0,
        quantity: 1,
    };
    let order_id = client
        .schedule_new_instance_typed("OrderProcessingWorkflow", &uuid::Uuid::new_v4().to_string(), &order)
        .await?;
    let started = client.wait_for_start(&order_id, Duration::from_secs(10)).await?;
    println!("Your workflow has started. Status: {:?}", started.status);
    let done = client.wait_for_completion(&order_id, Duration::from_secs(30)).await?;
    println!("Workflow status: {:?}", done.status);

    let fanout_id = client
        .schedule_new_instance_typed("FanoutWorkflow", "fanout-demo", &FanoutPayload { value: 5 })
        .await?;
    client.wait_for_start(&fanout_id, Duration::from_secs(10)).await?;
    let result: FanoutPayload = client
        .wait_for_completion_typed(&fanout_id, Duration::from_secs(30))
        .await?;
    println!("Fanout finished with value {}", result.value);

    rt.shutdown().await;
    Ok(())
}
