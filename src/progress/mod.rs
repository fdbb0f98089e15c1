//! In-process fan-out of execution progress events.
//!
//! The scheduler pushes a full [`ExecutionProgress`] snapshot on every state
//! change; any number of subscribers (the SSE endpoint, tests) receive them
//! keyed by execution id. The bus is process-global: one instance is created
//! at engine start and shared behind an `Arc`. Emits for a given execution
//! reach each subscriber in emit order; a dead subscriber is logged and
//! skipped, never halting the fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::workflow::ExecutionProgress;

struct Subscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<ExecutionProgress>,
}

/// Publish/subscribe table keyed by execution id.
#[derive(Default)]
pub struct ProgressBus {
    subscribers: Mutex<HashMap<i64, Vec<Subscriber>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one execution's progress events.
    ///
    /// The returned subscription deregisters itself on drop, so a
    /// disconnecting SSE client cleans up its slot automatically.
    pub fn subscribe(self: Arc<Self>, execution_id: i64) -> ProgressSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.table()
            .entry(execution_id)
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!("progress subscriber {id} registered for execution {execution_id}");

        ProgressSubscription {
            bus: self,
            execution_id,
            id,
            rx,
        }
    }

    /// Remove a subscriber; the execution's entry is dropped with its last
    /// subscriber.
    pub fn unsubscribe(&self, execution_id: i64, subscriber_id: Uuid) {
        let mut table = self.table();
        if let Some(subs) = table.get_mut(&execution_id) {
            subs.retain(|s| s.id != subscriber_id);
            if subs.is_empty() {
                table.remove(&execution_id);
            }
        }
    }

    /// Deliver a snapshot to every subscriber of its execution.
    pub fn emit(&self, progress: &ExecutionProgress) {
        let table = self.table();
        let Some(subs) = table.get(&progress.execution_id) else {
            return;
        };
        for sub in subs {
            if sub.tx.send(progress.clone()).is_err() {
                tracing::warn!(
                    "progress subscriber {} for execution {} is gone; skipping",
                    sub.id,
                    progress.execution_id
                );
            }
        }
    }

    /// Number of live subscribers for an execution.
    pub fn subscriber_count(&self, execution_id: i64) -> usize {
        self.table().get(&execution_id).map_or(0, Vec::len)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Vec<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live subscription to one execution's progress stream.
pub struct ProgressSubscription {
    bus: Arc<ProgressBus>,
    execution_id: i64,
    id: Uuid,
    rx: mpsc::UnboundedReceiver<ExecutionProgress>,
}

impl ProgressSubscription {
    /// Receive the next snapshot; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<ExecutionProgress> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests to drain buffered snapshots.
    pub fn try_recv(&mut self) -> Option<ExecutionProgress> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.execution_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ExecutionStatus;

    fn snapshot(execution_id: i64, status: ExecutionStatus) -> ExecutionProgress {
        ExecutionProgress {
            execution_id,
            workflow_id: 1,
            status,
            nodes: vec![],
            error: None,
        }
    }

    #[tokio::test]
    async fn subscribers_see_emits_in_order() {
        let bus = Arc::new(ProgressBus::new());
        let mut sub = bus.clone().subscribe(7);

        bus.emit(&snapshot(7, ExecutionStatus::Pending));
        bus.emit(&snapshot(7, ExecutionStatus::Running));
        bus.emit(&snapshot(7, ExecutionStatus::Completed));

        assert_eq!(sub.recv().await.unwrap().status, ExecutionStatus::Pending);
        assert_eq!(sub.recv().await.unwrap().status, ExecutionStatus::Running);
        assert_eq!(sub.recv().await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn emits_fan_out_to_all_subscribers_of_the_execution() {
        let bus = Arc::new(ProgressBus::new());
        let mut a = bus.clone().subscribe(1);
        let mut b = bus.clone().subscribe(1);
        let mut other = bus.clone().subscribe(2);

        bus.emit(&snapshot(1, ExecutionStatus::Running));

        assert_eq!(a.recv().await.unwrap().execution_id, 1);
        assert_eq!(b.recv().await.unwrap().execution_id, 1);
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_deregisters_and_last_drop_removes_entry() {
        let bus = Arc::new(ProgressBus::new());
        let a = bus.clone().subscribe(3);
        let b = bus.clone().subscribe(3);
        assert_eq!(bus.subscriber_count(3), 2);

        drop(a);
        assert_eq!(bus.subscriber_count(3), 1);
        drop(b);
        assert_eq!(bus.subscriber_count(3), 0);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = Arc::new(ProgressBus::new());
        bus.emit(&snapshot(42, ExecutionStatus::Running));
    }
}
