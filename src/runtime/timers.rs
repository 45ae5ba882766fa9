use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use super::OrchestratorMsg;

/// Request to fire `task_id` of `instance` at `fire_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerSchedule {
    pub fire_at_ms: u64,
    pub instance: String,
    pub task_id: u64,
}

/// In-process timer service.
/// Keeps a min-ordered queue of schedules and emits `TimerFired` messages when due.
pub(crate) struct TimerService {
    rx: UnboundedReceiver<TimerSchedule>,
    fired_tx: UnboundedSender<OrchestratorMsg>,
    // (instance, task_id) already queued; re-arming after recovery is a no-op
    keys: HashSet<(String, u64)>,
    min_heap: BinaryHeap<Reverse<TimerSchedule>>,
}

impl TimerService {
    pub fn start(
        fired_tx: UnboundedSender<OrchestratorMsg>,
    ) -> (tokio::task::JoinHandle<()>, UnboundedSender<TimerSchedule>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<TimerSchedule>();
        let mut svc = TimerService {
            rx,
            fired_tx,
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            let now = now_ms();
            while let Some(Reverse(next)) = self.min_heap.peek() {
                if next.fire_at_ms > now {
                    break;
                }
                let Some(Reverse(due)) = self.min_heap.pop() else { break };
                self.keys.remove(&(due.instance.clone(), due.task_id));
                tracing::debug!(
                    target: "durable_workflow::runtime",
                    instance_id = %due.instance,
                    task_id = due.task_id,
                    fire_at_ms = due.fire_at_ms,
                    "timer fired"
                );
                let msg = OrchestratorMsg::TimerFired {
                    instance: due.instance,
                    task_id: due.task_id,
                    fire_at_ms: due.fire_at_ms,
                };
                if self.fired_tx.send(msg).is_err() {
                    return;
                }
            }

            if let Some(Reverse(next)) = self.min_heap.peek() {
                let dur_ms = next.fire_at_ms.saturating_sub(now_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => match maybe {
                        Some(item) => self.insert_item(item),
                        None => return,
                    },
                }
            } else {
                match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    None => return,
                }
            }
        }
    }

    fn insert_item(&mut self, item: TimerSchedule) {
        if self.keys.insert((item.instance.clone(), item.task_id)) {
            self.min_heap.push(Reverse(item));
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
