use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

/// Lifecycle state of a registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Pending,
    Active,
    Degraded,
    Unreachable,
    Disabled,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Active => "active",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Unreachable => "unreachable",
            ClusterStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ClusterStatus::Pending),
            "active" => Ok(ClusterStatus::Active),
            "degraded" => Ok(ClusterStatus::Degraded),
            "unreachable" => Ok(ClusterStatus::Unreachable),
            "disabled" => Ok(ClusterStatus::Disabled),
            other => Err(HubError::InvalidInput(format!(
                "Invalid cluster status: {other}"
            ))),
        }
    }
}

/// A cluster known to the hub. Created (or reused) when an agent registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    /// Human name, unique across clusters.
    pub name: String,
    /// Agent-supplied stable identifier of the physical cluster; unique when set.
    pub fingerprint: Option<String>,
    pub status: ClusterStatus,
    pub kubernetes_version: String,
    pub platform: String,
    pub node_count: i32,
    pub region: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on every accepted heartbeat; NULL until the agent first reports in.
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Agent-reported cluster attributes, captured at registration and refreshed
/// on heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub kubernetes_version: String,
    pub platform: String,
    pub node_count: i32,
    pub region: String,
    pub labels: BTreeMap<String, String>,
}

/// The closed set of operation kinds an agent knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ApplyManifests,
    ListResources,
    GetResource,
    DeleteResource,
    Describe,
    Logs,
    Exec,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::ApplyManifests => "apply_manifests",
            OperationType::ListResources => "list_resources",
            OperationType::GetResource => "get_resource",
            OperationType::DeleteResource => "delete_resource",
            OperationType::Describe => "describe",
            OperationType::Logs => "logs",
            OperationType::Exec => "exec",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply_manifests" => Ok(OperationType::ApplyManifests),
            "list_resources" => Ok(OperationType::ListResources),
            "get_resource" => Ok(OperationType::GetResource),
            "delete_resource" => Ok(OperationType::DeleteResource),
            "describe" => Ok(OperationType::Describe),
            "logs" => Ok(OperationType::Logs),
            "exec" => Ok(OperationType::Exec),
            other => Err(HubError::InvalidInput(format!(
                "Invalid operation type: {other}"
            ))),
        }
    }
}

/// Lifecycle state of an operation. The last four are terminal: once
/// entered, no further transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded
                | OperationStatus::Failed
                | OperationStatus::Cancelled
                | OperationStatus::TimedOut
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "queued" => Ok(OperationStatus::Queued),
            "running" => Ok(OperationStatus::Running),
            "succeeded" => Ok(OperationStatus::Succeeded),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            "timed_out" => Ok(OperationStatus::TimedOut),
            other => Err(HubError::InvalidInput(format!(
                "Invalid operation status: {other}"
            ))),
        }
    }
}

/// One unit of work targeted at one cluster.
///
/// The payload and result blobs are opaque to the hub; only the agent
/// interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub cluster_id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub payload: Option<serde_json::Value>,
    pub status: OperationStatus,
    pub result: Option<serde_json::Value>,
    pub message: String,
    pub timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        cluster_id: Uuid,
        op_type: OperationType,
        payload: Option<serde_json::Value>,
        timeout_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            op_type,
            payload,
            status: OperationStatus::Pending,
            result: None,
            message: String::new(),
            timeout_seconds,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Absolute wall-clock deadline derived from submission time.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_seconds)
    }
}

/// Terminal outcome reported by an agent for one operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
    pub result: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Paginated cluster listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListClustersResponse {
    pub offset: i64,
    pub limit: i64,
    pub full_count: i64,
    pub items: Vec<Cluster>,
}

/// Paginated operation listing for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOperationsResponse {
    pub offset: i64,
    pub limit: i64,
    pub items: Vec<Operation>,
}

/// Body of a `202 Accepted` submission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub operation_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_status_round_trips() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Queued,
            OperationStatus::Running,
            OperationStatus::Succeeded,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
            OperationStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(OperationStatus::TimedOut.is_terminal());
    }

    #[test]
    fn unknown_operation_type_is_rejected() {
        let err = "reboot_cluster".parse::<OperationType>().unwrap_err();
        assert!(err.to_string().contains("Invalid operation type"));
    }

    #[test]
    fn operation_deadline_tracks_timeout() {
        let op = Operation::new(Uuid::new_v4(), OperationType::Describe, None, 60);
        assert_eq!(op.deadline() - op.created_at, chrono::Duration::seconds(60));
    }
}
