//! HTTP client for the snapshot endpoint.
//!
//! One request per call, no retries. A missing snapshot (404) reads as the
//! empty graph.

use std::time::Duration;

use flowchart_core::GraphSnapshot;
use reqwest::StatusCode;

/// Transport failures of the persistence endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Load and store the last-saved graph.
#[async_trait::async_trait]
pub trait SnapshotPersistence: Send + Sync + 'static {
    async fn fetch_snapshot(&self) -> Result<GraphSnapshot, TransportError>;

    /// Overwrite the saved graph. Returns the server's acknowledgement.
    async fn push_snapshot(&self, snapshot: &GraphSnapshot) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub base_url: String,
    pub timeout: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl PersistenceConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

pub struct SnapshotClient {
    client: reqwest::Client,
    data_url: String,
}

impl SnapshotClient {
    pub fn new(config: PersistenceConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            data_url: format!("{}/data", config.base_url.trim_end_matches('/')),
        })
    }

    pub fn data_url(&self) -> &str {
        &self.data_url
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status { status, body })
}

#[async_trait::async_trait]
impl SnapshotPersistence for SnapshotClient {
    async fn fetch_snapshot(&self) -> Result<GraphSnapshot, TransportError> {
        let response = self.client.get(&self.data_url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("No snapshot saved yet at {}", self.data_url);
            return Ok(GraphSnapshot::default());
        }
        let snapshot: GraphSnapshot = error_for_status(response).await?.json().await?;
        log::debug!(
            "Fetched snapshot: {} nodes, {} edges",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        Ok(snapshot)
    }

    async fn push_snapshot(&self, snapshot: &GraphSnapshot) -> Result<String, TransportError> {
        let response = self.client.post(&self.data_url).json(snapshot).send().await?;
        // The endpoint acknowledges with a JSON string.
        let ack: String = error_for_status(response).await?.json().await?;
        Ok(ack)
    }
}
