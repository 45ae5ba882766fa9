use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::WorkflowContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Activity,
    SubOrchestration,
    Timer,
}

/// Resolved value of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    SubOrchestration(Result<String, String>),
    Timer,
}

impl DurableOutput {
    /// Flatten into the payload result; a fired timer yields an empty output.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r,
            DurableOutput::Timer => Ok(String::new()),
        }
    }
}

/// Handle for one scheduled unit of durable work.
///
/// The task id is reserved and the scheduling decision recorded when the
/// handle is created, so dropping an un-awaited handle does not unschedule it.
/// Resolution is by task id lookup against history.
pub struct DurableFuture {
    task_id: u64,
    kind: TaskKind,
    ctx: WorkflowContext,
}

impl DurableFuture {
    pub(crate) fn new(task_id: u64, kind: TaskKind, ctx: WorkflowContext) -> Self {
        Self { task_id, kind, ctx }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> + Send {
        let task_id = self.task_id;
        async move {
            match self.await {
                DurableOutput::Activity(r) => r,
                other => Err(format!("task {task_id} resolved as {other:?}, expected an activity result")),
            }
        }
    }

    pub fn into_activity_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> + Send {
        let fut = self.into_activity();
        async move { Json::decode::<Out>(&fut.await?) }
    }

    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> + Send {
        let task_id = self.task_id;
        async move {
            match self.await {
                DurableOutput::SubOrchestration(r) => r,
                other => Err(format!("task {task_id} resolved as {other:?}, expected a child result")),
            }
        }
    }

    pub fn into_sub_orchestration_typed<Out: DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<Out, String>> + Send {
        let fut = self.into_sub_orchestration();
        async move { Json::decode::<Out>(&fut.await?) }
    }

    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.await;
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.poll_task(self.task_id)
    }
}

/// Waits for every handle and yields outputs in scheduling order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(mut children: Vec<DurableFuture>) -> Self {
        children.sort_by_key(|f| f.task_id);
        let results = vec![None; children.len()];
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            if let Poll::Ready(output) = Pin::new(child).poll(cx) {
                *slot = Some(output);
            }
        }
        if this.results.iter().all(Option::is_some) {
            Poll::Ready(this.results.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}
