//! Per-agent channel: the hub-side half of one `StreamOperations` stream.
//!
//! Outbound, a bounded queue of operation events drained by the gRPC stream
//! task. Inbound, a one-shot waiter table that `ReportResult` calls resolve
//! by operation id. The channel owns its in-flight waiters exclusively:
//! closing it drains every waiter with `agent_disconnected`, which is what
//! guarantees an operation is never delivered on two streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HubError;
use crate::models::{Operation, OperationOutcome};

/// Message written to the agent's operation stream.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Dispatch(Operation),
    Cancel { operation_id: Uuid, reason: String },
}

/// Event pushed to a registered operation waiter.
#[derive(Debug)]
pub enum ChannelEvent {
    Result(OperationOutcome),
    Disconnected,
}

struct Inner {
    cluster_id: Uuid,
    tx: mpsc::Sender<OutboundEvent>,
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<ChannelEvent>>>,
    last_heartbeat: Mutex<Instant>,
    closed: CancellationToken,
}

#[derive(Clone)]
pub struct AgentChannel {
    inner: Arc<Inner>,
}

impl AgentChannel {
    /// Returns the channel and the receiver the gRPC stream task drains.
    pub fn new(cluster_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let channel = Self {
            inner: Arc::new(Inner {
                cluster_id,
                tx,
                waiters: Mutex::new(HashMap::new()),
                last_heartbeat: Mutex::new(Instant::now()),
                closed: CancellationToken::new(),
            }),
        };
        (channel, rx)
    }

    pub fn cluster_id(&self) -> Uuid {
        self.inner.cluster_id
    }

    /// Two handles to the same underlying channel.
    pub fn same_channel(&self, other: &AgentChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Enqueue an operation for the agent.
    pub fn send(&self, op: Operation) -> Result<(), HubError> {
        if self.inner.closed.is_cancelled() {
            return Err(HubError::ChannelClosed);
        }
        match self.inner.tx.try_send(OutboundEvent::Dispatch(op)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(HubError::ChannelFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::ChannelClosed),
        }
    }

    /// Best-effort downstream cancellation notice. Failure is fine; the hub
    /// already considers the operation cancelled.
    pub fn send_cancel(&self, operation_id: Uuid, reason: &str) {
        let _ = self.inner.tx.try_send(OutboundEvent::Cancel {
            operation_id,
            reason: reason.to_string(),
        });
    }

    /// Register a one-shot listener for this operation's result.
    pub fn on_result(&self, operation_id: Uuid) -> Result<oneshot::Receiver<ChannelEvent>, HubError> {
        if self.inner.closed.is_cancelled() {
            return Err(HubError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().insert(operation_id, tx);
        Ok(rx)
    }

    pub fn cancel_wait(&self, operation_id: Uuid) {
        self.inner.waiters.lock().remove(&operation_id);
    }

    /// Resolve the waiter for an inbound result. Unknown operation ids are
    /// logged and dropped.
    pub fn deliver(&self, operation_id: Uuid, outcome: OperationOutcome) -> bool {
        match self.inner.waiters.lock().remove(&operation_id) {
            Some(tx) => tx.send(ChannelEvent::Result(outcome)).is_ok(),
            None => {
                tracing::warn!(
                    cluster_id = %self.inner.cluster_id,
                    %operation_id,
                    "dropping result for unknown operation"
                );
                false
            }
        }
    }

    pub fn touch(&self) {
        *self.inner.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.inner.last_heartbeat.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token the stream task watches to know the channel is gone.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Idempotent. Ends the stream and fails every in-flight waiter with
    /// `agent_disconnected`.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        let waiters: Vec<(Uuid, oneshot::Sender<ChannelEvent>)> =
            self.inner.waiters.lock().drain().collect();
        if !waiters.is_empty() {
            tracing::info!(
                cluster_id = %self.inner.cluster_id,
                in_flight = waiters.len(),
                reason,
                "agent channel closed with operations in flight"
            );
        } else {
            tracing::info!(cluster_id = %self.inner.cluster_id, reason, "agent channel closed");
        }
        for (_, tx) in waiters {
            let _ = tx.send(ChannelEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationType;

    fn op() -> Operation {
        Operation::new(Uuid::new_v4(), OperationType::Describe, None, 60)
    }

    fn outcome(success: bool) -> OperationOutcome {
        OperationOutcome {
            success,
            message: "done".into(),
            result: Some(serde_json::json!({"items": []})),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn send_and_drain() {
        let (channel, mut rx) = AgentChannel::new(Uuid::new_v4(), 4);
        let dispatched = op();
        channel.send(dispatched.clone()).unwrap();
        match rx.recv().await.unwrap() {
            OutboundEvent::Dispatch(received) => assert_eq!(received.id, dispatched.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_outbound_queue_is_reported() {
        let (channel, _rx) = AgentChannel::new(Uuid::new_v4(), 1);
        channel.send(op()).unwrap();
        let err = channel.send(op()).unwrap_err();
        assert!(matches!(err, HubError::ChannelFull));
    }

    #[tokio::test]
    async fn result_is_delivered_to_the_waiter() {
        let (channel, _rx) = AgentChannel::new(Uuid::new_v4(), 4);
        let operation_id = Uuid::new_v4();
        let rx = channel.on_result(operation_id).unwrap();
        assert!(channel.deliver(operation_id, outcome(true)));
        match rx.await.unwrap() {
            ChannelEvent::Result(o) => assert!(o.success),
            ChannelEvent::Disconnected => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn unknown_result_is_dropped() {
        let (channel, _rx) = AgentChannel::new(Uuid::new_v4(), 4);
        assert!(!channel.deliver(Uuid::new_v4(), outcome(true)));
    }

    #[tokio::test]
    async fn close_drains_waiters_with_disconnect() {
        let (channel, _rx) = AgentChannel::new(Uuid::new_v4(), 4);
        let rx = channel.on_result(Uuid::new_v4()).unwrap();
        channel.close("test");
        channel.close("again"); // idempotent
        match rx.await.unwrap() {
            ChannelEvent::Disconnected => {}
            ChannelEvent::Result(_) => panic!("expected disconnect"),
        }
        let err = channel.send(op()).unwrap_err();
        assert!(matches!(err, HubError::ChannelClosed));
        let err = channel.on_result(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, HubError::ChannelClosed));
    }
}
