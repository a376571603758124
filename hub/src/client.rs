use anyhow::{Context, Result, bail};
use reqwest::Client;
use uuid::Uuid;

use crate::models::{Cluster, ListClustersResponse, ListOperationsResponse, Operation};

/// Client for interacting with the hub's HTTP API.
#[derive(Clone)]
pub struct HubClient {
    client: Client,
    base_url: String,
}

impl HubClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_endpoint(endpoint: Option<&str>) -> Self {
        Self::new(endpoint.unwrap_or(armada_common::DEFAULT_ENDPOINT))
    }

    /// Check if the hub is healthy.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send health request")?;

        if resp.status().is_success() {
            Ok(())
        } else {
            bail!("health check failed with status: {}", resp.status())
        }
    }

    pub async fn list_clusters(&self, limit: i64, offset: i64) -> Result<ListClustersResponse> {
        let url = format!(
            "{}/clusters?limit={}&offset={}",
            self.base_url, limit, offset
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send list clusters request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("list clusters failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode cluster list")
    }

    pub async fn get_cluster(&self, id: Uuid) -> Result<Cluster> {
        let url = format!("{}/clusters/{}", self.base_url, id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send get cluster request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("get cluster failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode cluster")
    }

    pub async fn list_operations(
        &self,
        cluster_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<ListOperationsResponse> {
        let url = format!(
            "{}/clusters/{}/operations?limit={}&offset={}",
            self.base_url, cluster_id, limit, offset
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send list operations request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("list operations failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode operation list")
    }

    pub async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        let url = format!("{}/operations/{}", self.base_url, id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send get operation request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("get operation failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode operation")
    }

    pub async fn cancel_operation(&self, id: Uuid) -> Result<()> {
        let url = format!("{}/operations/{}/cancel", self.base_url, id);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("failed to send cancel request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("cancel failed with status {}: {}", status, body);
        }
        Ok(())
    }
}
