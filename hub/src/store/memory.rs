//! In-memory store with the same semantics as the Postgres backend.
//! Backs the test suite and the `--store memory` development mode.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::HubError;
use crate::models::{Cluster, ClusterInfo, ClusterStatus, Operation, OperationStatus};
use crate::store::{ClusterStore, NewCluster, OperationStore};

#[derive(Default)]
struct Inner {
    clusters: HashMap<Uuid, Cluster>,
    operations: HashMap<Uuid, Operation>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn create(&self, new: NewCluster) -> Result<Cluster, HubError> {
        let mut inner = self.inner.lock();
        if inner.clusters.values().any(|c| c.name == new.name) {
            return Err(HubError::AlreadyExists(format!("cluster {}", new.name)));
        }
        if let Some(ref fp) = new.fingerprint
            && inner
                .clusters
                .values()
                .any(|c| c.fingerprint.as_deref() == Some(fp))
        {
            return Err(HubError::AlreadyExists(format!("fingerprint {fp}")));
        }
        let now = Utc::now();
        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: new.name,
            fingerprint: new.fingerprint,
            status: ClusterStatus::Pending,
            kubernetes_version: new.info.kubernetes_version,
            platform: new.info.platform,
            node_count: new.info.node_count,
            region: new.info.region,
            labels: new.info.labels,
            created_at: now,
            updated_at: now,
            last_seen_at: None,
        };
        inner.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Cluster>, HubError> {
        Ok(self.inner.lock().clusters.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Cluster>, HubError> {
        Ok(self
            .inner
            .lock()
            .clusters
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Cluster>, HubError> {
        Ok(self
            .inner
            .lock()
            .clusters
            .values()
            .find(|c| c.fingerprint.as_deref() == Some(fingerprint))
            .cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Cluster>, HubError> {
        let inner = self.inner.lock();
        let mut all: Vec<Cluster> = inner.clusters.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self) -> Result<i64, HubError> {
        Ok(self.inner.lock().clusters.len() as i64)
    }

    async fn update_status(&self, id: Uuid, status: ClusterStatus) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("cluster {id}")))?;
        cluster.status = status;
        cluster.updated_at = Utc::now();
        Ok(())
    }

    async fn update_last_seen(&self, id: Uuid) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("cluster {id}")))?;
        let now = Utc::now();
        cluster.last_seen_at = Some(now);
        cluster.updated_at = now;
        Ok(())
    }

    async fn update_info(&self, id: Uuid, info: &ClusterInfo) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("cluster {id}")))?;
        cluster.kubernetes_version = info.kubernetes_version.clone();
        cluster.platform = info.platform.clone();
        cluster.node_count = info.node_count;
        cluster.region = info.region.clone();
        cluster.labels = info.labels.clone();
        cluster.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        if inner.clusters.remove(&id).is_none() {
            return Err(HubError::NotFound(format!("cluster {id}")));
        }
        inner.operations.retain(|_, op| op.cluster_id != id);
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn create(&self, op: &Operation) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        if inner.operations.contains_key(&op.id) {
            return Err(HubError::AlreadyExists(format!("operation {}", op.id)));
        }
        inner.operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, HubError> {
        Ok(self.inner.lock().operations.get(&id).cloned())
    }

    async fn list_by_cluster(
        &self,
        cluster_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Operation>, HubError> {
        let inner = self.inner.lock();
        let mut ops: Vec<Operation> = inner
            .operations
            .values()
            .filter(|op| op.cluster_id == cluster_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(ops
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_status(&self, id: Uuid, status: OperationStatus) -> Result<(), HubError> {
        if status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "terminal status {status} requires set_finished"
            )));
        }
        let mut inner = self.inner.lock();
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("operation {id}")))?;
        if op.status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "operation {id} is already {}",
                op.status
            )));
        }
        op.status = status;
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn set_started(&self, id: Uuid) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("operation {id}")))?;
        if op.status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "operation {id} is already {}",
                op.status
            )));
        }
        let now = Utc::now();
        op.status = OperationStatus::Running;
        op.started_at = Some(now);
        op.updated_at = now;
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
        let mut inner = self.inner.lock();
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("operation {id}")))?;
        if op.status.is_terminal() {
            return Err(HubError::InvalidTransition(format!(
                "operation {id} is already {}",
                op.status
            )));
        }
        let now = Utc::now();
        op.status = status;
        op.message = message.to_string();
        op.finished_at = Some(now);
        op.updated_at = now;
        Ok(())
    }

    async fn update_result(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| HubError::NotFound(format!("operation {id}")))?;
        op.result = result;
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), HubError> {
        self.set_finished(id, OperationStatus::Cancelled, reason)
            .await
    }

    async fn fail_all_non_terminal(&self, message: &str) -> Result<u64, HubError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut failed = 0;
        for op in inner.operations.values_mut() {
            if !op.status.is_terminal() {
                op.status = OperationStatus::Failed;
                op.message = message.to_string();
                op.finished_at = Some(now);
                op.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationType;

    // MemoryStore implements both store traits, and a few method names
    // (create, get, delete) exist on each; calls below are qualified
    // through the trait they mean.

    fn new_cluster(name: &str, fp: Option<&str>) -> NewCluster {
        NewCluster {
            name: name.to_string(),
            fingerprint: fp.map(String::from),
            info: ClusterInfo::default(),
        }
    }

    async fn put_cluster(store: &MemoryStore, new: NewCluster) -> Result<Cluster, HubError> {
        ClusterStore::create(store, new).await
    }

    async fn put_op(store: &MemoryStore, op: &Operation) -> Result<(), HubError> {
        OperationStore::create(store, op).await
    }

    async fn get_op(store: &MemoryStore, id: Uuid) -> Option<Operation> {
        OperationStore::get(store, id).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_names_and_fingerprints_are_rejected() {
        let store = MemoryStore::new();
        put_cluster(&store, new_cluster("prod", Some("fp-1")))
            .await
            .unwrap();

        let err = put_cluster(&store, new_cluster("prod", Some("fp-2")))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::AlreadyExists(_)));

        let err = put_cluster(&store, new_cluster("staging", Some("fp-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn lookup_by_name_and_fingerprint() {
        let store = MemoryStore::new();
        let created = put_cluster(&store, new_cluster("prod-east", Some("fp-1")))
            .await
            .unwrap();
        assert_eq!(created.status, ClusterStatus::Pending);

        let by_name = store.get_by_name("prod-east").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        let by_fp = store.get_by_fingerprint("fp-1").await.unwrap().unwrap();
        assert_eq!(by_fp.id, created.id);
        assert!(store.get_by_name("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_cluster_operations() {
        let store = MemoryStore::new();
        let cluster = put_cluster(&store, new_cluster("prod", None)).await.unwrap();
        let op = Operation::new(cluster.id, OperationType::Describe, None, 60);
        put_op(&store, &op).await.unwrap();

        ClusterStore::delete(&store, cluster.id).await.unwrap();
        assert!(get_op(&store, op.id).await.is_none());

        let err = ClusterStore::delete(&store, cluster.id).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let store = MemoryStore::new();
        let op = Operation::new(Uuid::new_v4(), OperationType::Describe, None, 60);
        put_op(&store, &op).await.unwrap();

        store
            .set_finished(op.id, OperationStatus::Succeeded, "done")
            .await
            .unwrap();

        let err = store
            .set_finished(op.id, OperationStatus::Failed, "late")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition(_)));
        let err = store.set_started(op.id).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition(_)));
        let err = store.cancel(op.id, "too late").await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition(_)));

        let stored = get_op(&store, op.id).await.unwrap();
        assert_eq!(stored.status, OperationStatus::Succeeded);
        assert_eq!(stored.message, "done");
    }

    #[tokio::test]
    async fn set_finished_rejects_non_terminal_targets() {
        let store = MemoryStore::new();
        let op = Operation::new(Uuid::new_v4(), OperationType::Logs, None, 60);
        put_op(&store, &op).await.unwrap();
        let err = store
            .set_finished(op.id, OperationStatus::Running, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn list_by_cluster_is_newest_first() {
        let store = MemoryStore::new();
        let cluster_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut op = Operation::new(cluster_id, OperationType::Describe, None, 60);
            op.created_at = Utc::now() + chrono::Duration::seconds(i);
            put_op(&store, &op).await.unwrap();
            ids.push(op.id);
        }
        let listed = store.list_by_cluster(cluster_id, 10, 0).await.unwrap();
        let listed_ids: Vec<Uuid> = listed.iter().map(|op| op.id).collect();
        ids.reverse();
        assert_eq!(listed_ids, ids);

        let page = store.list_by_cluster(cluster_id, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[1]);
    }

    #[tokio::test]
    async fn restart_recovery_fails_only_live_operations() {
        let store = MemoryStore::new();
        let cluster_id = Uuid::new_v4();
        let live = Operation::new(cluster_id, OperationType::Describe, None, 60);
        let done = Operation::new(cluster_id, OperationType::Describe, None, 60);
        put_op(&store, &live).await.unwrap();
        put_op(&store, &done).await.unwrap();
        store
            .set_finished(done.id, OperationStatus::Succeeded, "done")
            .await
            .unwrap();

        let failed = store.fail_all_non_terminal("hub_restart").await.unwrap();
        assert_eq!(failed, 1);

        let recovered = get_op(&store, live.id).await.unwrap();
        assert_eq!(recovered.status, OperationStatus::Failed);
        assert_eq!(recovered.message, "hub_restart");
        let untouched = get_op(&store, done.id).await.unwrap();
        assert_eq!(untouched.status, OperationStatus::Succeeded);
    }
}
