//! Persistence seams for the cluster registry and the operation log.
//!
//! The store is the source of truth for cluster and operation state; every
//! in-memory structure in the orchestrator is derived from it. Two
//! implementations exist: `postgres` for production and `memory` for tests
//! and single-process development.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::HubError;
use crate::models::{Cluster, ClusterInfo, ClusterStatus, Operation, OperationStatus};

pub mod memory;
pub mod postgres;

/// Fields captured when a cluster first registers.
#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
    pub fingerprint: Option<String>,
    pub info: ClusterInfo,
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Insert a new cluster with `status=pending`. Fails with
    /// `already_exists` on a name or fingerprint collision.
    async fn create(&self, new: NewCluster) -> Result<Cluster, HubError>;

    async fn get(&self, id: Uuid) -> Result<Option<Cluster>, HubError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Cluster>, HubError>;

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Cluster>, HubError>;

    /// Newest-first page of clusters.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Cluster>, HubError>;

    async fn count(&self) -> Result<i64, HubError>;

    async fn update_status(&self, id: Uuid, status: ClusterStatus) -> Result<(), HubError>;

    /// Stamp `last_seen_at` with the current time.
    async fn update_last_seen(&self, id: Uuid) -> Result<(), HubError>;

    /// Refresh the agent-reported attributes (version, platform, labels, …).
    async fn update_info(&self, id: Uuid, info: &ClusterInfo) -> Result<(), HubError>;

    /// Remove the cluster and, transitively, its operation log.
    async fn delete(&self, id: Uuid) -> Result<(), HubError>;
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, op: &Operation) -> Result<(), HubError>;

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, HubError>;

    /// Operations for one cluster ordered `created_at` descending,
    /// tie-broken by id descending.
    async fn list_by_cluster(
        &self,
        cluster_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Operation>, HubError>;

    /// Non-terminal bookkeeping transition (e.g. pending → queued).
    /// Rejects terminal targets and rows already in a terminal state.
    async fn update_status(&self, id: Uuid, status: OperationStatus) -> Result<(), HubError>;

    /// status=running, started_at=now. Rejected once the row is terminal.
    async fn set_started(&self, id: Uuid) -> Result<(), HubError>;

    /// The single atomic claim of a terminal state: sets status, message and
    /// `finished_at` in one write guarded on the row not already being
    /// terminal. Exactly one caller wins; the rest get `invalid_transition`.
    async fn set_finished(
        &self,
        id: Uuid,
        status: OperationStatus,
        message: &str,
    ) -> Result<(), HubError>;

    /// Attach the result blob. Called only by whoever won `set_finished`.
    async fn update_result(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), HubError>;

    /// Atomic non-terminal → cancelled transition.
    async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), HubError>;

    /// Fail every non-terminal operation with the given message; used at
    /// startup because in-memory queue state does not survive a restart.
    async fn fail_all_non_terminal(&self, message: &str) -> Result<u64, HubError>;
}
