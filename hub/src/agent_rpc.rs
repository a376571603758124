//! tonic implementation of the agent control protocol.
//!
//! Thin translation layer: every RPC validates its session token, converts
//! between wire messages and domain types, and hands off to the registry,
//! session manager or orchestrator.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use chrono::DateTime;
use futures::Stream;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::cache::{Cache, keys};
use crate::channel::{AgentChannel, OutboundEvent};
use crate::models::{ClusterInfo, ClusterStatus, Operation, OperationOutcome};
use crate::proto::agent as pb;
use crate::proto::agent::agent_service_server::AgentService;
use crate::server::AppState;

/// Tag carried on every payload envelope the hub emits.
pub const PAYLOAD_TYPE_URL: &str = "hub.armada.dev/json";

const METRICS_CACHE_TTL: Duration = Duration::from_secs(120);

pub struct AgentServiceImpl {
    state: AppState,
}

impl AgentServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn cache(&self) -> Option<&Cache> {
        self.state.cache.as_ref()
    }
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid {what}: {raw}")))
}

impl From<pb::ClusterInfo> for ClusterInfo {
    fn from(info: pb::ClusterInfo) -> Self {
        ClusterInfo {
            kubernetes_version: info.kubernetes_version,
            platform: info.platform,
            node_count: info.node_count.min(i32::MAX as u32) as i32,
            region: info.region,
            labels: info.labels.into_iter().collect(),
        }
    }
}

fn payload_to_proto(value: &serde_json::Value) -> pb::Payload {
    pb::Payload {
        type_url: PAYLOAD_TYPE_URL.to_string(),
        value: serde_json::to_vec(value).unwrap_or_default(),
    }
}

fn payload_from_proto(payload: &pb::Payload) -> Option<serde_json::Value> {
    if payload.value.is_empty() {
        return None;
    }
    match serde_json::from_slice(&payload.value) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(type_url = %payload.type_url, error = %e, "undecodable payload envelope");
            None
        }
    }
}

fn operation_to_proto(op: &Operation) -> pb::Operation {
    pb::Operation {
        id: op.id.to_string(),
        cluster_id: op.cluster_id.to_string(),
        r#type: op.op_type.as_str().to_string(),
        payload: op.payload.as_ref().map(payload_to_proto),
        created_at_ms: op.created_at.timestamp_millis(),
        timeout_seconds: op.timeout_seconds,
    }
}

fn event_to_proto(event: OutboundEvent) -> pb::OperationEvent {
    let event = match event {
        OutboundEvent::Dispatch(op) => {
            pb::operation_event::Event::Operation(operation_to_proto(&op))
        }
        OutboundEvent::Cancel {
            operation_id,
            reason,
        } => pb::operation_event::Event::Cancel(pb::CancelOperation {
            operation_id: operation_id.to_string(),
            reason,
        }),
    };
    pb::OperationEvent { event: Some(event) }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let req = request.into_inner();
        let fingerprint = if req.fingerprint.is_empty() {
            None
        } else {
            Some(req.fingerprint)
        };
        let info: ClusterInfo = req.cluster_info.map(Into::into).unwrap_or_default();

        let cluster = self
            .state
            .registry
            .register(&req.cluster_name, fingerprint, info)
            .await
            .map_err(Status::from)?;
        let session = self.state.sessions.issue(cluster.id);

        tracing::info!(
            cluster_id = %cluster.id,
            name = %cluster.name,
            agent_version = %req.agent_version,
            "agent registered"
        );
        counter!("hub_agent_registrations_total").increment(1);

        Ok(Response::new(pb::RegisterResponse {
            success: true,
            cluster_id: cluster.id.to_string(),
            session_token: session.token,
            heartbeat_interval_seconds: session.heartbeat_interval,
            message: "registered".to_string(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let cluster_id = parse_uuid(&req.cluster_id, "cluster_id")?;
        self.state
            .sessions
            .validate_for(&req.session_token, cluster_id)
            .map_err(Status::from)?;

        let reported = if req.status.is_empty() {
            None
        } else {
            match req.status.parse::<ClusterStatus>() {
                Ok(status) => Some(status),
                Err(_) => {
                    tracing::warn!(%cluster_id, status = %req.status, "ignoring unknown heartbeat status");
                    None
                }
            }
        };
        if let Some(info) = req.cluster_info {
            self.state
                .registry
                .update_info(cluster_id, &info.into())
                .await
                .map_err(Status::from)?;
        }
        self.state
            .registry
            .mark_seen(cluster_id, reported)
            .await
            .map_err(Status::from)?;
        self.state.orchestrator.touch_channel(cluster_id);
        counter!("hub_heartbeats_total").increment(1);

        Ok(Response::new(pb::HeartbeatResponse { success: true }))
    }

    type StreamOperationsStream =
        Pin<Box<dyn Stream<Item = Result<pb::OperationEvent, Status>> + Send>>;

    async fn stream_operations(
        &self,
        request: Request<pb::StreamOperationsRequest>,
    ) -> Result<Response<Self::StreamOperationsStream>, Status> {
        let req = request.into_inner();
        let cluster_id = parse_uuid(&req.cluster_id, "cluster_id")?;
        self.state
            .sessions
            .validate_for(&req.session_token, cluster_id)
            .map_err(Status::from)?;

        let (channel, mut events) =
            AgentChannel::new(cluster_id, self.state.channel_capacity);
        self.state.orchestrator.register_channel(channel.clone());

        let closed = channel.closed_token();
        let (tx, out_rx) = mpsc::channel(16);
        let orchestrator = self.state.orchestrator.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    // The agent went away; stop pumping immediately so its
                    // in-flight operations fail fast.
                    _ = tx.closed() => break,
                    event = events.recv() => match event {
                        None => break,
                        Some(event) => {
                            if tx.send(Ok(event_to_proto(event))).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            orchestrator.channel_closed(&channel, "operation stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }

    async fn report_result(
        &self,
        request: Request<pb::ReportResultRequest>,
    ) -> Result<Response<pb::ReportResultResponse>, Status> {
        let req = request.into_inner();
        let cluster_id = parse_uuid(&req.cluster_id, "cluster_id")?;
        let operation_id = parse_uuid(&req.operation_id, "operation_id")?;
        self.state
            .sessions
            .validate_for(&req.session_token, cluster_id)
            .map_err(Status::from)?;

        let outcome = OperationOutcome {
            success: req.success,
            message: req.message,
            result: req.result.as_ref().and_then(payload_from_proto),
            completed_at: DateTime::from_timestamp_millis(req.completed_at_ms),
        };
        // Unknown or already-terminal operations are logged and dropped by
        // the demux; the report itself is still acknowledged.
        self.state
            .orchestrator
            .deliver_result(cluster_id, operation_id, outcome);
        counter!("hub_results_reported_total").increment(1);

        Ok(Response::new(pb::ReportResultResponse { success: true }))
    }

    async fn stream_logs(
        &self,
        request: Request<Streaming<pb::LogEntry>>,
    ) -> Result<Response<pb::StreamAck>, Status> {
        let mut stream = request.into_inner();
        let mut received = 0u32;
        while let Some(entry) = stream.message().await? {
            let cluster_id = parse_uuid(&entry.cluster_id, "cluster_id")?;
            self.state
                .sessions
                .validate_for(&entry.session_token, cluster_id)
                .map_err(Status::from)?;
            tracing::debug!(
                %cluster_id,
                level = %entry.level,
                message = %entry.message,
                "agent log"
            );
            received = received.saturating_add(1);
        }
        counter!("hub_agent_log_entries_total").increment(received as u64);
        Ok(Response::new(pb::StreamAck {
            success: true,
            received,
        }))
    }

    async fn stream_metrics(
        &self,
        request: Request<Streaming<pb::MetricEntry>>,
    ) -> Result<Response<pb::StreamAck>, Status> {
        let mut stream = request.into_inner();
        let mut received = 0u32;
        let mut latest: HashMap<Uuid, serde_json::Map<String, serde_json::Value>> = HashMap::new();
        while let Some(entry) = stream.message().await? {
            let cluster_id = parse_uuid(&entry.cluster_id, "cluster_id")?;
            self.state
                .sessions
                .validate_for(&entry.session_token, cluster_id)
                .map_err(Status::from)?;
            latest.entry(cluster_id).or_default().insert(
                entry.name,
                serde_json::json!({
                    "value": entry.value,
                    "timestamp_ms": entry.timestamp_ms,
                    "labels": entry.labels,
                }),
            );
            received = received.saturating_add(1);
        }
        if let Some(cache) = self.cache() {
            for (cluster_id, metrics) in latest {
                cache
                    .set(
                        &keys::cluster_metrics(cluster_id),
                        &serde_json::Value::Object(metrics),
                        METRICS_CACHE_TTL,
                    )
                    .await;
            }
        }
        counter!("hub_agent_metric_entries_total").increment(received as u64);
        Ok(Response::new(pb::StreamAck {
            success: true,
            received,
        }))
    }
}
