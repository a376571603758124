//! Cluster registry: registration policy and cache-aside reads over the
//! cluster store.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{Cache, keys};
use crate::error::HubError;
use crate::models::{Cluster, ClusterInfo, ClusterStatus};
use crate::store::{ClusterStore, NewCluster};

const CLUSTER_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn ClusterStore>,
    cache: Option<Cache>,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn ClusterStore>, cache: Option<Cache>) -> Self {
        Self { store, cache }
    }

    /// Admit a registering agent.
    ///
    /// A known fingerprint reuses the existing record (the agent restarted
    /// or reconnected); otherwise a new cluster is created as `pending` and
    /// promoted to `active` by its first heartbeat.
    pub async fn register(
        &self,
        name: &str,
        fingerprint: Option<String>,
        info: ClusterInfo,
    ) -> Result<Cluster, HubError> {
        if name.is_empty() {
            return Err(HubError::InvalidInput(
                "Invalid registration: cluster_name is required".into(),
            ));
        }
        if let Some(ref fp) = fingerprint
            && let Some(existing) = self.store.get_by_fingerprint(fp).await?
        {
            self.store.update_info(existing.id, &info).await?;
            self.invalidate(existing.id).await;
            tracing::info!(cluster_id = %existing.id, name = %existing.name, "re-registered cluster");
            return Ok(self
                .store
                .get(existing.id)
                .await?
                .ok_or_else(|| HubError::NotFound(format!("cluster {}", existing.id)))?);
        }
        let cluster = self
            .store
            .create(NewCluster {
                name: name.to_string(),
                fingerprint,
                info,
            })
            .await?;
        tracing::info!(cluster_id = %cluster.id, name = %cluster.name, "registered new cluster");
        Ok(cluster)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Cluster>, HubError> {
        if let Some(cache) = &self.cache
            && let Some(cluster) = cache.get::<Cluster>(&keys::cluster(id)).await
        {
            return Ok(Some(cluster));
        }
        let cluster = self.store.get(id).await?;
        if let (Some(cache), Some(cluster)) = (&self.cache, &cluster) {
            cache
                .set(&keys::cluster(id), cluster, CLUSTER_CACHE_TTL)
                .await;
        }
        Ok(cluster)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Cluster>, HubError> {
        self.store.get_by_name(name).await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Cluster>, i64), HubError> {
        let items = self.store.list(limit, offset).await?;
        let full_count = self.store.count().await?;
        Ok((items, full_count))
    }

    pub async fn update_status(&self, id: Uuid, status: ClusterStatus) -> Result<(), HubError> {
        self.store.update_status(id, status).await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Record a heartbeat: stamp last-seen, fold in the agent-reported
    /// status, and promote `pending` clusters on their first report.
    pub async fn mark_seen(
        &self,
        id: Uuid,
        reported: Option<ClusterStatus>,
    ) -> Result<(), HubError> {
        let cluster = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("cluster {id}")))?;
        self.store.update_last_seen(id).await?;

        // Disabled is operator-set; a heartbeat must not revive it.
        let next = if cluster.status == ClusterStatus::Disabled {
            None
        } else {
            match reported {
                Some(status) if status != cluster.status => Some(status),
                None if cluster.status == ClusterStatus::Pending => Some(ClusterStatus::Active),
                None if cluster.status == ClusterStatus::Unreachable => {
                    Some(ClusterStatus::Active)
                }
                _ => None,
            }
        };
        if let Some(status) = next {
            self.store.update_status(id, status).await?;
        }
        self.invalidate(id).await;
        Ok(())
    }

    pub async fn update_info(&self, id: Uuid, info: &ClusterInfo) -> Result<(), HubError> {
        self.store.update_info(id, info).await?;
        self.invalidate(id).await;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), HubError> {
        self.store.delete(id).await?;
        if let Some(cache) = &self.cache {
            cache.delete_matching(&keys::cluster_prefix(id)).await;
        }
        Ok(())
    }

    async fn invalidate(&self, id: Uuid) {
        if let Some(cache) = &self.cache {
            cache.delete(&keys::cluster(id)).await;
            cache.delete(&keys::cluster_status(id)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(Arc::new(MemoryStore::new()), None)
    }

    #[tokio::test]
    async fn registration_is_idempotent_per_fingerprint() {
        let registry = registry();
        let first = registry
            .register("prod-east", Some("fp-1".into()), ClusterInfo::default())
            .await
            .unwrap();
        assert_eq!(first.status, ClusterStatus::Pending);

        let second = registry
            .register("prod-east-renamed", Some("fp-1".into()), ClusterInfo::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn name_collision_without_fingerprint_match_is_rejected() {
        let registry = registry();
        registry
            .register("prod", Some("fp-1".into()), ClusterInfo::default())
            .await
            .unwrap();
        let err = registry
            .register("prod", Some("fp-2".into()), ClusterInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn empty_name_is_invalid() {
        let registry = registry();
        let err = registry
            .register("", None, ClusterInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn first_heartbeat_promotes_pending_to_active() {
        let registry = registry();
        let cluster = registry
            .register("prod", Some("fp-1".into()), ClusterInfo::default())
            .await
            .unwrap();

        registry.mark_seen(cluster.id, None).await.unwrap();
        let seen = registry.get(cluster.id).await.unwrap().unwrap();
        assert_eq!(seen.status, ClusterStatus::Active);
        assert!(seen.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_folds_in_reported_status() {
        let registry = registry();
        let cluster = registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();
        registry
            .mark_seen(cluster.id, Some(ClusterStatus::Degraded))
            .await
            .unwrap();
        let seen = registry.get(cluster.id).await.unwrap().unwrap();
        assert_eq!(seen.status, ClusterStatus::Degraded);
    }

    #[tokio::test]
    async fn heartbeat_does_not_revive_disabled_clusters() {
        let registry = registry();
        let cluster = registry
            .register("prod", None, ClusterInfo::default())
            .await
            .unwrap();
        registry
            .update_status(cluster.id, ClusterStatus::Disabled)
            .await
            .unwrap();
        registry
            .mark_seen(cluster.id, Some(ClusterStatus::Active))
            .await
            .unwrap();
        let seen = registry.get(cluster.id).await.unwrap().unwrap();
        assert_eq!(seen.status, ClusterStatus::Disabled);
    }
}
