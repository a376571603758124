//! Advisory Redis cache for cluster metadata and resource snapshots.
//!
//! Every error degrades to a miss: callers always fall back to the store,
//! which remains the source of truth. Operation state is never served from
//! here.

use std::time::Duration;

use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

#[derive(Clone)]
pub struct Cache {
    pool: Pool,
}

impl Cache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache unavailable");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        let Ok(mut conn) = self.pool.get().await else {
            return;
        };
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
            .await
        {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        let Ok(mut conn) = self.pool.get().await else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(key).await {
            tracing::warn!(key, error = %e, "cache delete failed");
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let Ok(mut conn) = self.pool.get().await else {
            return Vec::new();
        };
        match conn.keys::<_, Vec<String>>(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "cache keys scan failed");
                Vec::new()
            }
        }
    }

    /// Invalidate every key matching the pattern. The hub keyspace is small
    /// and prefixed, so KEYS is acceptable here.
    pub async fn delete_matching(&self, pattern: &str) {
        let keys = self.keys(pattern).await;
        if keys.is_empty() {
            return;
        }
        let Ok(mut conn) = self.pool.get().await else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(keys).await {
            tracing::warn!(pattern, error = %e, "cache invalidation failed");
        }
    }

    pub async fn ping(&self) -> bool {
        let Ok(mut conn) = self.pool.get().await else {
            return false;
        };
        conn.ping::<String>().await.is_ok()
    }
}

/// Key helpers; keep every cache key construction here.
pub mod keys {
    use super::*;

    pub fn cluster(id: Uuid) -> String {
        format!("cluster:{id}")
    }

    pub fn cluster_status(id: Uuid) -> String {
        format!("cluster:{id}:status")
    }

    pub fn cluster_metrics(id: Uuid) -> String {
        format!("cluster:{id}:metrics")
    }

    pub fn cluster_prefix(id: Uuid) -> String {
        format!("cluster:{id}*")
    }

    pub fn operation(id: Uuid) -> String {
        format!("operation:{id}")
    }

    pub fn session(token: &str) -> String {
        format!("session:{token}")
    }

    pub fn resource(cluster_id: Uuid, kind: &str, namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("cluster:{cluster_id}:resource:{kind}:{namespace}:{name}"),
            None => format!("cluster:{cluster_id}:resource:{kind}:{namespace}"),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn resource_keys_are_stable() {
            let id = Uuid::nil();
            assert_eq!(
                resource(id, "Pod", "default", None),
                format!("cluster:{id}:resource:Pod:default")
            );
            assert_eq!(
                resource(id, "Pod", "default", Some("api-0")),
                format!("cluster:{id}:resource:Pod:default:api-0")
            );
            assert_eq!(cluster_status(id), format!("cluster:{id}:status"));
        }
    }
}
