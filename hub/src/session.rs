//! Session manager: the capability issued to an agent at registration.
//!
//! Sessions are memory-only; an agent that outlives a hub restart simply
//! re-registers and is rehydrated onto the same cluster record by its
//! fingerprint. At most one token is valid per cluster at any moment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use uuid::Uuid;

use crate::error::HubError;

/// A short-lived capability bound to one cluster.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub cluster_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub heartbeat_interval: u32,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, Uuid>,
    by_cluster: HashMap<Uuid, String>,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
    heartbeat_interval: u32,
}

impl SessionManager {
    pub fn new(heartbeat_interval: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            heartbeat_interval: heartbeat_interval.max(1),
        }
    }

    pub fn heartbeat_interval(&self) -> u32 {
        self.heartbeat_interval
    }

    /// Issue a fresh token for the cluster, atomically revoking any prior one.
    pub fn issue(&self, cluster_id: Uuid) -> Session {
        let token = random_token();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.by_cluster.insert(cluster_id, token.clone()) {
            inner.by_token.remove(&old);
        }
        inner.by_token.insert(token.clone(), cluster_id);
        Session {
            token,
            cluster_id,
            issued_at: Utc::now(),
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    pub fn validate(&self, token: &str) -> Option<Uuid> {
        self.inner.lock().by_token.get(token).copied()
    }

    /// Validate that the token is live and bound to the claimed cluster.
    pub fn validate_for(&self, token: &str, cluster_id: Uuid) -> Result<(), HubError> {
        match self.validate(token) {
            Some(bound) if bound == cluster_id => Ok(()),
            _ => Err(HubError::SessionInvalid),
        }
    }

    pub fn revoke(&self, cluster_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.by_cluster.remove(&cluster_id) {
            inner.by_token.remove(&token);
        }
    }
}

/// 32 bytes of OS randomness, hex-encoded. Opaque to callers; no embedded
/// state.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_validate() {
        let sessions = SessionManager::new(30);
        let cluster_id = Uuid::new_v4();
        let session = sessions.issue(cluster_id);
        assert_eq!(session.token.len(), 64);
        assert_eq!(sessions.validate(&session.token), Some(cluster_id));
        assert!(sessions.validate_for(&session.token, cluster_id).is_ok());
        assert!(sessions.validate("bogus").is_none());
    }

    #[test]
    fn reissue_revokes_prior_token() {
        let sessions = SessionManager::new(30);
        let cluster_id = Uuid::new_v4();
        let first = sessions.issue(cluster_id);
        let second = sessions.issue(cluster_id);
        assert_ne!(first.token, second.token);
        assert!(sessions.validate(&first.token).is_none());
        assert_eq!(sessions.validate(&second.token), Some(cluster_id));
    }

    #[test]
    fn token_is_bound_to_its_cluster() {
        let sessions = SessionManager::new(30);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let session = sessions.issue(a);
        let err = sessions.validate_for(&session.token, b).unwrap_err();
        assert!(matches!(err, HubError::SessionInvalid));
    }

    #[test]
    fn revoke_drops_the_token() {
        let sessions = SessionManager::new(30);
        let cluster_id = Uuid::new_v4();
        let session = sessions.issue(cluster_id);
        sessions.revoke(cluster_id);
        assert!(sessions.validate(&session.token).is_none());
        // Idempotent
        sessions.revoke(cluster_id);
    }
}
