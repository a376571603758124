//! The orchestrator: accepts operations, queues them per cluster, dispatches
//! them to connected agent channels, enforces deadlines and records results.
//!
//! A fixed pool of workers pulls from the dispatch queue. Dispatch is
//! serialized per cluster (submission order reaches the agent in order) and
//! parallel across clusters; waiting for a result is not serialized, so one
//! cluster can have several operations in flight. The operation store is
//! the source of truth throughout; everything in here is derived state and
//! is rebuilt (by failing leftovers) after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{AgentChannel, ChannelEvent};
use crate::error::HubError;
use crate::models::{
    ClusterStatus, Operation, OperationOutcome, OperationStatus, OperationType,
};
use crate::queue::DispatchQueue;
use crate::registry::ClusterRegistry;
use crate::session::SessionManager;
use crate::store::OperationStore;

const MAX_TIMEOUT_SECONDS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Dispatch worker pool size.
    pub workers: usize,
    /// Outbound buffer per agent channel.
    pub channel_capacity: usize,
    /// Queued-operation bound per cluster.
    pub queue_depth: usize,
    /// Server-chosen heartbeat interval handed to agents, in seconds.
    pub heartbeat_interval: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            channel_capacity: 64,
            queue_depth: 256,
            heartbeat_interval: 30,
        }
    }
}

struct OrchestratorInner {
    registry: ClusterRegistry,
    operations: Arc<dyn OperationStore>,
    sessions: Arc<SessionManager>,
    queue: DispatchQueue,
    channels: RwLock<HashMap<Uuid, AgentChannel>>,
    op_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Wakes workers parked on "no agent channel for this cluster yet".
    channel_added: Notify,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        registry: ClusterRegistry,
        operations: Arc<dyn OperationStore>,
        sessions: Arc<SessionManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                operations,
                sessions,
                queue: DispatchQueue::new(config.queue_depth),
                channels: RwLock::new(HashMap::new()),
                op_cancels: Mutex::new(HashMap::new()),
                channel_added: Notify::new(),
                config,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Recover from a previous run, then start the worker pool and the
    /// heartbeat monitor.
    pub async fn start(&self) -> Result<(), HubError> {
        // In-memory queue state did not survive; every non-terminal
        // operation is unaccounted for and must reach a terminal state.
        let recovered = self
            .inner
            .operations
            .fail_all_non_terminal("hub_restart")
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "failed operations left over from a previous run");
        }

        let mut tasks = self.inner.tasks.lock();
        for worker in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                worker_main(inner, worker).await;
            }));
        }
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            monitor_main(inner).await;
        }));
        Ok(())
    }

    /// Create and enqueue an operation; returns immediately with its id.
    pub async fn submit(
        &self,
        cluster_id: Uuid,
        op_type: OperationType,
        payload: Option<serde_json::Value>,
        timeout_seconds: i64,
    ) -> Result<Uuid, HubError> {
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
            return Err(HubError::InvalidInput(format!(
                "Invalid timeout: must be between 1 and {MAX_TIMEOUT_SECONDS} seconds"
            )));
        }
        let cluster = self
            .inner
            .registry
            .get(cluster_id)
            .await?
            .ok_or(HubError::ClusterNotFound(cluster_id))?;
        if cluster.status == ClusterStatus::Disabled {
            return Err(HubError::ClusterDisabled(cluster_id));
        }

        let op = Operation::new(cluster_id, op_type, payload, timeout_seconds);
        self.inner.operations.create(&op).await?;
        // Token exists before the enqueue so a cancel can always release a
        // parked worker.
        self.inner.cancel_token(op.id);
        if let Err(e) = self.inner.queue.push(cluster_id, op.id) {
            let _ = self
                .inner
                .operations
                .set_finished(op.id, OperationStatus::Failed, &e.to_string())
                .await;
            self.inner.drop_cancel(op.id);
            return Err(e);
        }
        if let Err(e) = self
            .inner
            .operations
            .update_status(op.id, OperationStatus::Queued)
            .await
        {
            // Lost a race with an immediate cancel; the queue entry is
            // already being torn down.
            tracing::debug!(operation_id = %op.id, error = %e, "operation not marked queued");
        }
        counter!("hub_operations_submitted_total", "type" => op_type.as_str()).increment(1);
        gauge!("hub_queue_depth").set(self.inner.queue.len() as f64);
        Ok(op.id)
    }

    /// Transition a non-terminal operation to `cancelled`, releasing any
    /// worker parked on it and nudging the agent best-effort.
    pub async fn cancel(&self, operation_id: Uuid, reason: &str) -> Result<(), HubError> {
        let op = self
            .inner
            .operations
            .get(operation_id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("operation {operation_id}")))?;
        self.inner.operations.cancel(operation_id, reason).await?;

        let dropped_from_queue = self.inner.queue.remove(op.cluster_id, operation_id);
        let token = self.inner.op_cancels.lock().get(&operation_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        if dropped_from_queue {
            // No worker will ever see this operation; clean up here.
            self.inner.drop_cancel(operation_id);
        }
        if let Some(channel) = self.inner.channel_for(op.cluster_id) {
            channel.cancel_wait(operation_id);
            channel.send_cancel(operation_id, reason);
        }
        counter!("hub_operations_finished_total", "status" => "cancelled").increment(1);
        Ok(())
    }

    /// Register the channel for a freshly opened operation stream. Any
    /// previous channel for the cluster is superseded and closed, which
    /// fails its in-flight operations with `agent_disconnected`.
    pub fn register_channel(&self, channel: AgentChannel) {
        let cluster_id = channel.cluster_id();
        let previous = self.inner.channels.write().insert(cluster_id, channel);
        if let Some(previous) = previous {
            previous.close("superseded by a new agent session");
        }
        self.inner.channel_added.notify_waiters();
        gauge!("hub_connected_agents").set(self.inner.channels.read().len() as f64);
        tracing::info!(%cluster_id, "agent channel registered");
    }

    /// Tear down a channel: close it, drop it from the index (only if it is
    /// still the current one) and revoke the session.
    pub fn channel_closed(&self, channel: &AgentChannel, reason: &str) {
        self.inner.remove_channel(channel, reason);
    }

    pub fn touch_channel(&self, cluster_id: Uuid) {
        if let Some(channel) = self.inner.channel_for(cluster_id) {
            channel.touch();
        }
    }

    /// Demux an inbound `ReportResult` to the waiting worker.
    pub fn deliver_result(
        &self,
        cluster_id: Uuid,
        operation_id: Uuid,
        outcome: OperationOutcome,
    ) -> bool {
        match self.inner.channel_for(cluster_id) {
            Some(channel) => channel.deliver(operation_id, outcome),
            None => {
                tracing::warn!(%cluster_id, %operation_id, "result for a cluster with no channel");
                false
            }
        }
    }

    pub fn connected_agents(&self) -> usize {
        self.inner.channels.read().len()
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.queue.close();
        let channels: Vec<AgentChannel> = {
            let mut map = self.inner.channels.write();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close("hub shutting down");
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl OrchestratorInner {
    fn channel_for(&self, cluster_id: Uuid) -> Option<AgentChannel> {
        self.channels.read().get(&cluster_id).cloned()
    }

    fn remove_channel(&self, channel: &AgentChannel, reason: &str) {
        channel.close(reason);
        let cluster_id = channel.cluster_id();
        let removed = {
            let mut channels = self.channels.write();
            if channels
                .get(&cluster_id)
                .is_some_and(|current| current.same_channel(channel))
            {
                channels.remove(&cluster_id);
                true
            } else {
                false
            }
        };
        if removed {
            self.sessions.revoke(cluster_id);
            gauge!("hub_connected_agents").set(self.channels.read().len() as f64);
            tracing::info!(%cluster_id, reason, "agent channel unregistered");
        }
    }

    fn cancel_token(&self, operation_id: Uuid) -> CancellationToken {
        self.op_cancels
            .lock()
            .entry(operation_id)
            .or_default()
            .clone()
    }

    fn drop_cancel(&self, operation_id: Uuid) {
        self.op_cancels.lock().remove(&operation_id);
    }

    /// Terminal write that tolerates losing the race to another writer.
    async fn finish(&self, operation_id: Uuid, status: OperationStatus, message: &str) {
        match self.operations.set_finished(operation_id, status, message).await {
            Ok(()) => {
                counter!("hub_operations_finished_total", "status" => status.as_str())
                    .increment(1);
            }
            Err(HubError::InvalidTransition(_)) => {}
            Err(e) => {
                tracing::error!(%operation_id, error = %e, "failed to finish operation");
            }
        }
    }
}

enum Dispatched {
    /// The operation is on the wire; await its result.
    Sent {
        channel: AgentChannel,
        rx: tokio::sync::oneshot::Receiver<ChannelEvent>,
        deadline: DateTime<Utc>,
    },
    /// The operation reached a terminal state (or the hub is stopping)
    /// before a send happened.
    Abandoned,
}

async fn worker_main(inner: Arc<OrchestratorInner>, worker: usize) {
    tracing::debug!(worker, "dispatch worker started");
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            popped = inner.queue.pop() => {
                let Some((cluster_id, operation_id)) = popped else { return };
                run_operation(&inner, cluster_id, operation_id).await;
            }
        }
    }
}

async fn run_operation(inner: &Arc<OrchestratorInner>, cluster_id: Uuid, operation_id: Uuid) {
    let dispatched = dispatch(inner, cluster_id, operation_id).await;
    // The cluster's next operation may dispatch as soon as this one is on
    // the wire; results are allowed to arrive out of order.
    inner.queue.release(cluster_id);
    gauge!("hub_queue_depth").set(inner.queue.len() as f64);

    if let Dispatched::Sent {
        channel,
        rx,
        deadline,
    } = dispatched
    {
        await_result(inner, operation_id, channel, rx, deadline).await;
    }
    inner.drop_cancel(operation_id);
}

async fn dispatch(
    inner: &Arc<OrchestratorInner>,
    cluster_id: Uuid,
    operation_id: Uuid,
) -> Dispatched {
    let op = match inner.operations.get(operation_id).await {
        Ok(Some(op)) => op,
        Ok(None) => {
            tracing::warn!(%operation_id, "queued operation vanished from the store");
            return Dispatched::Abandoned;
        }
        Err(e) => {
            tracing::error!(%operation_id, error = %e, "failed to load queued operation");
            return Dispatched::Abandoned;
        }
    };
    if op.status.is_terminal() {
        // Cancelled while sitting in the queue.
        return Dispatched::Abandoned;
    }
    let cancel = inner.cancel_token(operation_id);
    let deadline = op.deadline();

    // Park until the cluster has a live channel, bounded by the deadline.
    let (channel, rx) = loop {
        let notified = inner.channel_added.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(channel) = inner.channel_for(cluster_id) {
            // Waiter goes in before the send so an immediate result
            // cannot slip past the demux.
            if let Ok(rx) = channel.on_result(operation_id) {
                break (channel, rx);
            }
            // Channel raced closed; park and wait for a replacement.
        }

        match inner.registry.get(cluster_id).await {
            Ok(Some(cluster)) if cluster.status == ClusterStatus::Disabled => {
                inner
                    .finish(operation_id, OperationStatus::Failed, "cluster_disabled")
                    .await;
                return Dispatched::Abandoned;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                inner
                    .finish(operation_id, OperationStatus::Failed, "cluster_not_found")
                    .await;
                return Dispatched::Abandoned;
            }
            Err(e) => {
                tracing::error!(%cluster_id, error = %e, "cluster lookup failed while parking");
            }
        }

        let Some(remaining) = remaining_time(deadline) else {
            inner
                .finish(
                    operation_id,
                    OperationStatus::TimedOut,
                    "timed_out waiting for an agent",
                )
                .await;
            return Dispatched::Abandoned;
        };
        tokio::select! {
            _ = inner.shutdown.cancelled() => return Dispatched::Abandoned,
            _ = cancel.cancelled() => return Dispatched::Abandoned,
            _ = tokio::time::sleep(remaining) => {
                inner
                    .finish(
                        operation_id,
                        OperationStatus::TimedOut,
                        "timed_out waiting for an agent",
                    )
                    .await;
                return Dispatched::Abandoned;
            }
            _ = &mut notified => {}
        }
    };

    // Running goes into the store before the send; combined with the
    // channel owning its waiters exclusively this rules out duplicate
    // dispatch across reconnects.
    if let Err(e) = inner.operations.set_started(operation_id).await {
        channel.cancel_wait(operation_id);
        tracing::debug!(%operation_id, error = %e, "skipping dispatch");
        return Dispatched::Abandoned;
    }

    loop {
        match channel.send(op.clone()) {
            Ok(()) => break,
            Err(HubError::ChannelFull) => {
                // Agent is backlogged; retry until the deadline.
                let Some(remaining) = remaining_time(deadline) else {
                    channel.cancel_wait(operation_id);
                    inner
                        .finish(operation_id, OperationStatus::TimedOut, "timed_out")
                        .await;
                    return Dispatched::Abandoned;
                };
                let backoff = Duration::from_millis(100).min(remaining);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        channel.cancel_wait(operation_id);
                        return Dispatched::Abandoned;
                    }
                    _ = cancel.cancelled() => {
                        channel.cancel_wait(operation_id);
                        return Dispatched::Abandoned;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(_) => {
                channel.cancel_wait(operation_id);
                inner
                    .finish(operation_id, OperationStatus::Failed, "agent_disconnected")
                    .await;
                return Dispatched::Abandoned;
            }
        }
    }
    counter!("hub_operations_dispatched_total").increment(1);
    tracing::debug!(%operation_id, %cluster_id, "operation dispatched");
    Dispatched::Sent {
        channel,
        rx,
        deadline,
    }
}

async fn await_result(
    inner: &Arc<OrchestratorInner>,
    operation_id: Uuid,
    channel: AgentChannel,
    rx: tokio::sync::oneshot::Receiver<ChannelEvent>,
    deadline: DateTime<Utc>,
) {
    let cancel = inner.cancel_token(operation_id);
    let remaining = remaining_time(deadline).unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = inner.shutdown.cancelled() => {
            channel.cancel_wait(operation_id);
        }
        _ = cancel.cancelled() => {
            // The store transition already happened in `cancel`.
            channel.cancel_wait(operation_id);
        }
        _ = tokio::time::sleep(remaining) => {
            channel.cancel_wait(operation_id);
            inner
                .finish(operation_id, OperationStatus::TimedOut, "timed_out")
                .await;
        }
        event = rx => match event {
            Ok(ChannelEvent::Result(outcome)) => {
                let status = if outcome.success {
                    OperationStatus::Succeeded
                } else {
                    OperationStatus::Failed
                };
                // Claim the terminal state first; only the winner attaches
                // the result blob.
                match inner
                    .operations
                    .set_finished(operation_id, status, &outcome.message)
                    .await
                {
                    Ok(()) => {
                        counter!("hub_operations_finished_total", "status" => status.as_str())
                            .increment(1);
                        if let Err(e) = inner
                            .operations
                            .update_result(operation_id, outcome.result)
                            .await
                        {
                            tracing::error!(%operation_id, error = %e, "failed to store result");
                        }
                    }
                    Err(HubError::InvalidTransition(_)) => {
                        tracing::debug!(%operation_id, "result arrived after a terminal state");
                    }
                    Err(e) => {
                        tracing::error!(%operation_id, error = %e, "failed to finish operation");
                    }
                }
            }
            Ok(ChannelEvent::Disconnected) | Err(_) => {
                inner
                    .finish(operation_id, OperationStatus::Failed, "agent_disconnected")
                    .await;
            }
        }
    }
}

async fn monitor_main(inner: Arc<OrchestratorInner>) {
    let interval = Duration::from_secs(inner.config.heartbeat_interval.max(1) as u64);
    let max_silence = interval * 3;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let stale: Vec<AgentChannel> = inner
            .channels
            .read()
            .values()
            .filter(|channel| channel.last_heartbeat().elapsed() > max_silence)
            .cloned()
            .collect();
        for channel in stale {
            let cluster_id = channel.cluster_id();
            tracing::warn!(%cluster_id, "agent missed heartbeats");
            if let Err(e) = inner
                .registry
                .update_status(cluster_id, ClusterStatus::Unreachable)
                .await
            {
                tracing::error!(%cluster_id, error = %e, "failed to mark cluster unreachable");
            }
            inner.remove_channel(&channel, "missed heartbeats");
        }
    }
}

fn remaining_time(deadline: DateTime<Utc>) -> Option<Duration> {
    (deadline - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OutboundEvent;
    use crate::models::ClusterInfo;
    use crate::store::memory::MemoryStore;
    use std::time::Instant;

    struct Harness {
        orchestrator: Orchestrator,
        registry: ClusterRegistry,
        store: MemoryStore,
    }

    impl Harness {
        async fn new(config: OrchestratorConfig) -> Self {
            let store = MemoryStore::new();
            let registry = ClusterRegistry::new(Arc::new(store.clone()), None);
            let sessions = Arc::new(SessionManager::new(config.heartbeat_interval));
            let orchestrator = Orchestrator::new(
                registry.clone(),
                Arc::new(store.clone()),
                sessions,
                config,
            );
            orchestrator.start().await.unwrap();
            Self {
                orchestrator,
                registry,
                store,
            }
        }

        async fn active_cluster(&self, name: &str) -> Uuid {
            let cluster = self
                .registry
                .register(name, Some(format!("fp-{name}")), ClusterInfo::default())
                .await
                .unwrap();
            self.registry.mark_seen(cluster.id, None).await.unwrap();
            cluster.id
        }

        fn connect_agent(
            &self,
            cluster_id: Uuid,
        ) -> (AgentChannel, tokio::sync::mpsc::Receiver<OutboundEvent>) {
            let (channel, rx) = AgentChannel::new(cluster_id, 16);
            self.orchestrator.register_channel(channel.clone());
            (channel, rx)
        }

        async fn wait_status(
            &self,
            operation_id: Uuid,
            expected: OperationStatus,
            timeout: Duration,
        ) -> Operation {
            let start = Instant::now();
            loop {
                let op = self
                    .store
                    .get(operation_id)
                    .await
                    .unwrap()
                    .expect("operation exists");
                if op.status == expected {
                    return op;
                }
                assert!(
                    start.elapsed() < timeout,
                    "operation {operation_id} stuck at {:?}, wanted {expected:?}",
                    op.status
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    #[tokio::test]
    async fn result_round_trips_through_the_store() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("prod-east").await;
        let (_channel, mut rx) = h.connect_agent(cluster_id);

        let payload = serde_json::json!({"manifests": "kind: Namespace"});
        let op_id = h
            .orchestrator
            .submit(
                cluster_id,
                OperationType::ApplyManifests,
                Some(payload.clone()),
                60,
            )
            .await
            .unwrap();

        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let OutboundEvent::Dispatch(op) = event {
                    assert_eq!(op.payload, Some(payload.clone()));
                    orchestrator.deliver_result(
                        cluster_id,
                        op.id,
                        OperationOutcome {
                            success: true,
                            message: "applied".into(),
                            result: Some(serde_json::json!({"applied": 1})),
                            completed_at: Some(Utc::now()),
                        },
                    );
                }
            }
        });

        let op = h
            .wait_status(op_id, OperationStatus::Succeeded, Duration::from_secs(5))
            .await;
        assert_eq!(op.message, "applied");

        // The result blob lands just after the terminal claim.
        let start = Instant::now();
        loop {
            let op = h.store.get(op_id).await.unwrap().unwrap();
            if op.result == Some(serde_json::json!({"applied": 1})) {
                assert!(op.started_at.unwrap() <= op.finished_at.unwrap());
                assert!(op.created_at <= op.started_at.unwrap());
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(2), "result never stored");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn no_agent_means_timed_out_after_the_deadline() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("lonely").await;

        let started = Instant::now();
        let op_id = h
            .orchestrator
            .submit(cluster_id, OperationType::ListResources, None, 2)
            .await
            .unwrap();

        let op = h
            .wait_status(op_id, OperationStatus::TimedOut, Duration::from_secs(6))
            .await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(op.finished_at.is_some());
        assert!(op.started_at.is_none());
    }

    #[tokio::test]
    async fn agent_disconnect_fails_running_operations() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("flaky").await;
        let (channel, mut rx) = h.connect_agent(cluster_id);

        let op_id = h
            .orchestrator
            .submit(cluster_id, OperationType::Exec, None, 60)
            .await
            .unwrap();

        // Wait until the operation is actually on the wire, then drop the agent.
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, OutboundEvent::Dispatch(_)));
        h.orchestrator.channel_closed(&channel, "stream closed");

        let op = h
            .wait_status(op_id, OperationStatus::Failed, Duration::from_secs(5))
            .await;
        assert!(op.message.contains("agent_disconnected"));
    }

    #[tokio::test]
    async fn dispatch_is_fifo_per_cluster() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("ordered").await;
        let (_channel, mut rx) = h.connect_agent(cluster_id);

        let mut submitted = Vec::new();
        for _ in 0..4 {
            submitted.push(
                h.orchestrator
                    .submit(cluster_id, OperationType::Describe, None, 60)
                    .await
                    .unwrap(),
            );
        }

        let mut dispatched = Vec::new();
        let orchestrator = h.orchestrator.clone();
        while dispatched.len() < submitted.len() {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let OutboundEvent::Dispatch(op) = event {
                dispatched.push(op.id);
                orchestrator.deliver_result(
                    cluster_id,
                    op.id,
                    OperationOutcome {
                        success: true,
                        message: String::new(),
                        result: None,
                        completed_at: None,
                    },
                );
            }
        }
        assert_eq!(dispatched, submitted);

        for id in &submitted {
            h.wait_status(*id, OperationStatus::Succeeded, Duration::from_secs(5))
                .await;
        }
        // started_at respects submission order
        let mut previous: Option<DateTime<Utc>> = None;
        for id in &submitted {
            let op = h.store.get(*id).await.unwrap().unwrap();
            let started = op.started_at.unwrap();
            if let Some(previous) = previous {
                assert!(previous <= started);
            }
            previous = Some(started);
        }
    }

    #[tokio::test]
    async fn submit_validates_the_cluster() {
        let h = Harness::new(OrchestratorConfig::default()).await;

        let err = h
            .orchestrator
            .submit(Uuid::new_v4(), OperationType::Describe, None, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ClusterNotFound(_)));

        let cluster_id = h.active_cluster("benched").await;
        h.registry
            .update_status(cluster_id, ClusterStatus::Disabled)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .submit(cluster_id, OperationType::Describe, None, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ClusterDisabled(_)));

        let err = h
            .orchestrator
            .submit(cluster_id, OperationType::Describe, None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cancel_releases_a_parked_operation() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("parked").await;

        let op_id = h
            .orchestrator
            .submit(cluster_id, OperationType::Logs, None, 60)
            .await
            .unwrap();
        // Give a worker time to park on the missing channel.
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.orchestrator.cancel(op_id, "operator changed their mind").await.unwrap();
        let op = h
            .wait_status(op_id, OperationStatus::Cancelled, Duration::from_secs(5))
            .await;
        assert_eq!(op.message, "operator changed their mind");

        // Cancelling a terminal operation is a conflict.
        let err = h.orchestrator.cancel(op_id, "again").await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition(_)));

        // The cluster's queue is healthy afterwards.
        let (_channel, mut rx) = h.connect_agent(cluster_id);
        let next = h
            .orchestrator
            .submit(cluster_id, OperationType::Describe, None, 60)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            OutboundEvent::Dispatch(op) => assert_eq!(op.id, next),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_of_a_running_operation_signals_the_agent() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("busy").await;
        let (_channel, mut rx) = h.connect_agent(cluster_id);

        let op_id = h
            .orchestrator
            .submit(cluster_id, OperationType::Exec, None, 60)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, OutboundEvent::Dispatch(_)));

        h.orchestrator.cancel(op_id, "taking too long").await.unwrap();
        h.wait_status(op_id, OperationStatus::Cancelled, Duration::from_secs(5))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            OutboundEvent::Cancel { operation_id, .. } => assert_eq!(operation_id, op_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn startup_fails_leftover_operations() {
        let store = MemoryStore::new();
        let leftover = Operation::new(Uuid::new_v4(), OperationType::Describe, None, 60);
        store.create(&leftover).await.unwrap();
        store.set_started(leftover.id).await.unwrap();

        let registry = ClusterRegistry::new(Arc::new(store.clone()), None);
        let sessions = Arc::new(SessionManager::new(30));
        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(store.clone()),
            sessions,
            OrchestratorConfig::default(),
        );
        orchestrator.start().await.unwrap();

        let op = store.get(leftover.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.message, "hub_restart");
    }

    #[tokio::test]
    async fn new_channel_supersedes_the_old_one() {
        let h = Harness::new(OrchestratorConfig::default()).await;
        let cluster_id = h.active_cluster("reconnector").await;

        let (first, _rx1) = h.connect_agent(cluster_id);
        let (second, _rx2) = h.connect_agent(cluster_id);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(h.orchestrator.connected_agents(), 1);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let config = OrchestratorConfig {
            workers: 0, // nothing drains the queue
            queue_depth: 2,
            ..OrchestratorConfig::default()
        };
        let h = Harness::new(config).await;
        let cluster_id = h.active_cluster("swamped").await;

        h.orchestrator
            .submit(cluster_id, OperationType::Describe, None, 60)
            .await
            .unwrap();
        h.orchestrator
            .submit(cluster_id, OperationType::Describe, None, 60)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .submit(cluster_id, OperationType::Describe, None, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ChannelFull));
    }
}
