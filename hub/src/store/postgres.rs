//! Postgres-backed store. Raw SQL over a deadpool pool; the schema is
//! created idempotently at startup.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::error::HubError;
use crate::models::{Cluster, ClusterInfo, ClusterStatus, Operation, OperationStatus};
use crate::store::{ClusterStore, NewCluster, OperationStore};

const TERMINAL_GUARD: &str = "status NOT IN ('succeeded', 'failed', 'cancelled', 'timed_out')";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema, creating tables if they don't exist.
    pub async fn init_schema(&self) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS clusters (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    fingerprint TEXT,
                    status TEXT NOT NULL,
                    kubernetes_version TEXT NOT NULL DEFAULT '',
                    platform TEXT NOT NULL DEFAULT '',
                    node_count INT NOT NULL DEFAULT 0,
                    region TEXT NOT NULL DEFAULT '',
                    labels JSONB,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    last_seen_at TIMESTAMPTZ
                )
                "#,
                &[],
            )
            .await
            .context("failed to create clusters table")?;

        client
            .execute(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_clusters_name ON clusters (name)
                "#,
                &[],
            )
            .await
            .context("failed to create cluster name index")?;

        client
            .execute(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_clusters_fingerprint
                ON clusters (fingerprint) WHERE fingerprint IS NOT NULL
                "#,
                &[],
            )
            .await
            .context("failed to create cluster fingerprint index")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS operations (
                    id UUID PRIMARY KEY,
                    cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
                    op_type TEXT NOT NULL,
                    payload JSONB,
                    status TEXT NOT NULL,
                    result JSONB,
                    message TEXT NOT NULL DEFAULT '',
                    timeout_seconds BIGINT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    finished_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ NOT NULL
                )
                "#,
                &[],
            )
            .await
            .context("failed to create operations table")?;

        // Covers ListByCluster's newest-first pagination
        client
            .execute(
                r#"
                CREATE INDEX IF NOT EXISTS idx_operations_cluster
                ON operations (cluster_id, created_at DESC, id DESC)
                "#,
                &[],
            )
            .await
            .context("failed to create operations cluster index")?;

        tracing::info!("database schema initialized");
        Ok(())
    }
}

fn cluster_from_row(row: &Row) -> Result<Cluster, HubError> {
    let status: String = row.get("status");
    let labels: Option<serde_json::Value> = row.get("labels");
    let labels = match labels {
        Some(value) => {
            serde_json::from_value(value).context("failed to decode cluster labels")?
        }
        None => Default::default(),
    };
    Ok(Cluster {
        id: row.get("id"),
        name: row.get("name"),
        fingerprint: row.get("fingerprint"),
        status: status.parse()?,
        kubernetes_version: row.get("kubernetes_version"),
        platform: row.get("platform"),
        node_count: row.get("node_count"),
        region: row.get("region"),
        labels,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_seen_at: row.get("last_seen_at"),
    })
}

fn operation_from_row(row: &Row) -> Result<Operation, HubError> {
    let op_type: String = row.get("op_type");
    let status: String = row.get("status");
    Ok(Operation {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        op_type: op_type.parse()?,
        payload: row.get("payload"),
        status: status.parse()?,
        result: row.get("result"),
        message: row.get("message"),
        timeout_seconds: row.get("timeout_seconds"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_unique_violation(e: tokio_postgres::Error, what: String) -> HubError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        HubError::AlreadyExists(what)
    } else {
        HubError::Internal(anyhow::Error::new(e).context("database write failed"))
    }
}

#[async_trait]
impl ClusterStore for PgStore {
    async fn create(&self, new: NewCluster) -> Result<Cluster, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let now = Utc::now();
        let labels =
            serde_json::to_value(&new.info.labels).context("failed to encode cluster labels")?;
        let row = client
            .query_one(
                r#"
                INSERT INTO clusters (
                    id, name, fingerprint, status, kubernetes_version, platform,
                    node_count, region, labels, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.name,
                    &new.fingerprint,
                    &ClusterStatus::Pending.as_str(),
                    &new.info.kubernetes_version,
                    &new.info.platform,
                    &new.info.node_count,
                    &new.info.region,
                    &labels,
                    &now,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, format!("cluster {}", new.name)))?;
        cluster_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Cluster>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt("SELECT * FROM clusters WHERE id = $1", &[&id])
            .await
            .context("failed to get cluster")?;
        row.map(|r| cluster_from_row(&r)).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Cluster>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt("SELECT * FROM clusters WHERE name = $1", &[&name])
            .await
            .context("failed to get cluster by name")?;
        row.map(|r| cluster_from_row(&r)).transpose()
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Cluster>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                "SELECT * FROM clusters WHERE fingerprint = $1",
                &[&fingerprint],
            )
            .await
            .context("failed to get cluster by fingerprint")?;
        row.map(|r| cluster_from_row(&r)).transpose()
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Cluster>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                r#"
                SELECT * FROM clusters
                ORDER BY created_at DESC, id DESC
                LIMIT $1 OFFSET $2
                "#,
                &[&limit, &offset],
            )
            .await
            .context("failed to list clusters")?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn count(&self) -> Result<i64, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_one("SELECT COUNT(*) FROM clusters", &[])
            .await
            .context("failed to count clusters")?;
        Ok(row.get(0))
    }

    async fn update_status(&self, id: Uuid, status: ClusterStatus) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                "UPDATE clusters SET status = $2, updated_at = $3 WHERE id = $1",
                &[&id, &status.as_str(), &Utc::now()],
            )
            .await
            .context("failed to update cluster status")?;
        if updated == 0 {
            return Err(HubError::NotFound(format!("cluster {id}")));
        }
        Ok(())
    }

    async fn update_last_seen(&self, id: Uuid) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                "UPDATE clusters SET last_seen_at = $2, updated_at = $2 WHERE id = $1",
                &[&id, &Utc::now()],
            )
            .await
            .context("failed to update cluster last seen")?;
        if updated == 0 {
            return Err(HubError::NotFound(format!("cluster {id}")));
        }
        Ok(())
    }

    async fn update_info(&self, id: Uuid, info: &ClusterInfo) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let labels =
            serde_json::to_value(&info.labels).context("failed to encode cluster labels")?;
        let updated = client
            .execute(
                r#"
                UPDATE clusters
                SET kubernetes_version = $2, platform = $3, node_count = $4,
                    region = $5, labels = $6, updated_at = $7
                WHERE id = $1
                "#,
                &[
                    &id,
                    &info.kubernetes_version,
                    &info.platform,
                    &info.node_count,
                    &info.region,
                    &labels,
                    &Utc::now(),
                ],
            )
            .await
            .context("failed to update cluster info")?;
        if updated == 0 {
            return Err(HubError::NotFound(format!("cluster {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let deleted = client
            .execute("DELETE FROM clusters WHERE id = $1", &[&id])
            .await
            .context("failed to delete cluster")?;
        if deleted == 0 {
            return Err(HubError::NotFound(format!("cluster {id}")));
        }
        Ok(())
    }
}

impl PgStore {
    /// 0-row terminal-guarded UPDATE: figure out whether the row is missing
    /// or already terminal.
    async fn classify_miss(&self, id: Uuid) -> HubError {
        match OperationStore::get(self, id).await {
            Ok(Some(op)) => {
                HubError::InvalidTransition(format!("operation {id} is already {}", op.status))
            }
            Ok(None) => HubError::NotFound(format!("operation {id}")),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OperationStore for PgStore {
    async fn create(&self, op: &Operation) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO operations (
                    id, cluster_id, op_type, payload, status, result, message,
                    timeout_seconds, created_at, started_at, finished_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
                &[
                    &op.id,
                    &op.cluster_id,
                    &op.op_type.as_str(),
                    &op.payload,
                    &op.status.as_str(),
                    &op.result,
                    &op.message,
                    &op.timeout_seconds,
                    &op.created_at,
                    &op.started_at,
                    &op.finished_at,
                    &op.updated_at,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, format!("operation {}", op.id)))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt("SELECT * FROM operations WHERE id = $1", &[&id])
            .await
            .context("failed to get operation")?;
        row.map(|r| operation_from_row(&r)).transpose()
    }

    async fn list_by_cluster(
        &self,
        cluster_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Operation>, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                r#"
                SELECT * FROM operations
                WHERE cluster_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&cluster_id, &limit, &offset],
            )
            .await
            .context("failed to list operations")?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn update_status(&self, id: Uuid, status: OperationStatus) -> Result<(), HubError> {
        if status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "terminal status {status} requires set_finished"
            )));
        }
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                format!(
                    "UPDATE operations SET status = $2, updated_at = $3 \
                     WHERE id = $1 AND {TERMINAL_GUARD}"
                )
                .as_str(),
                &[&id, &status.as_str(), &Utc::now()],
            )
            .await
            .context("failed to update operation status")?;
        if updated == 0 {
            return Err(self.classify_miss(id).await);
        }
        Ok(())
    }

    async fn set_started(&self, id: Uuid) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                format!(
                    "UPDATE operations SET status = 'running', started_at = $2, updated_at = $2 \
                     WHERE id = $1 AND {TERMINAL_GUARD}"
                )
                .as_str(),
                &[&id, &Utc::now()],
            )
            .await
            .context("failed to mark operation started")?;
        if updated == 0 {
            return Err(self.classify_miss(id).await);
        }
        Ok(())
    }

    async fn set_finished(
        &self,
        id: Uuid,
        status: OperationStatus,
        message: &str,
    ) -> Result<(), HubError> {
        if !status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "{status} is not a terminal status"
            )));
        }
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                format!(
                    "UPDATE operations SET status = $2, message = $3, finished_at = $4, \
                     updated_at = $4 WHERE id = $1 AND {TERMINAL_GUARD}"
                )
                .as_str(),
                &[&id, &status.as_str(), &message, &Utc::now()],
            )
            .await
            .context("failed to finish operation")?;
        if updated == 0 {
            return Err(self.classify_miss(id).await);
        }
        Ok(())
    }

    async fn update_result(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let updated = client
            .execute(
                "UPDATE operations SET result = $2, updated_at = $3 WHERE id = $1",
                &[&id, &result, &Utc::now()],
            )
            .await
            .context("failed to update operation result")?;
        if updated == 0 {
            return Err(HubError::NotFound(format!("operation {id}")));
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), HubError> {
        self.set_finished(id, OperationStatus::Cancelled, reason)
            .await
    }

    async fn fail_all_non_terminal(&self, message: &str) -> Result<u64, HubError> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let failed = client
            .execute(
                format!(
                    "UPDATE operations SET status = 'failed', message = $1, finished_at = $2, \
                     updated_at = $2 WHERE {TERMINAL_GUARD}"
                )
                .as_str(),
                &[&message, &Utc::now()],
            )
            .await
            .context("failed to fail non-terminal operations")?;
        Ok(failed)
    }
}
