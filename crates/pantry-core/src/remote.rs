//! Remote sync service contract
//!
//! The remote is authoritative. It exposes two endpoints:
//!
//! - `POST {base}/sync/push`: body is a JSON array of mutation records;
//!   response is a JSON array with one outcome per record
//! - `GET {base}/sync/pull?since=<cursor>`: response is a page of changed
//!   entities plus the cursor to resume from
//!
//! [`RemoteApi`] abstracts the transport so the engine can be driven by a
//! scripted remote in tests. [`HttpRemote`] is the reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::Entity;
use crate::queue::MutationRecord;

/// Transport-level failures talking to the remote
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Connection refused, DNS failure, reset...
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// 5xx from the remote
    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    /// 4xx from the remote (auth, unknown endpoint, malformed request).
    /// Says nothing about the individual records in it.
    #[error("Request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Response body did not match the contract
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Worth retrying on a later cycle
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }
}

/// Per-record verdict of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Accepted,
    Conflict,
    Rejected,
}

/// Outcome of one pushed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub mutation_id: String,
    pub status: PushStatus,
    /// Current remote version, sent with conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<Entity>,
    /// Why the record was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PushOutcome {
    pub fn accepted(mutation_id: impl Into<String>) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            status: PushStatus::Accepted,
            remote_version: None,
            reason: None,
        }
    }

    pub fn conflict(mutation_id: impl Into<String>, remote_version: Entity) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            status: PushStatus::Conflict,
            remote_version: Some(remote_version),
            reason: None,
        }
    }

    pub fn rejected(mutation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            status: PushStatus::Rejected,
            remote_version: None,
            reason: Some(reason.into()),
        }
    }
}

/// One page of remote changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    pub changes: Vec<Entity>,
    pub next_cursor: Option<String>,
    /// More changes are waiting behind `next_cursor`
    #[serde(default)]
    pub has_more: bool,
}

/// The remote sync service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Send a batch of mutations; one outcome per record
    async fn push(&self, batch: &[MutationRecord]) -> Result<Vec<PushOutcome>, RemoteError>;

    /// Fetch changes since a cursor (`None` fetches from the beginning)
    async fn pull(&self, since: Option<&str>) -> Result<PullPage, RemoteError>;
}

/// HTTP/JSON remote
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pantry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(RemoteError::Timeout);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(RemoteError::Server {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(RemoteError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn push(&self, batch: &[MutationRecord]) -> Result<Vec<PushOutcome>, RemoteError> {
        debug!(records = batch.len(), "POST /sync/push");

        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .json(batch)
            .send()
            .await
            .map_err(transport_error)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn pull(&self, since: Option<&str>) -> Result<PullPage, RemoteError> {
        debug!(since = since.unwrap_or(""), "GET /sync/pull");

        let mut request = self.client.get(format!("{}/sync/pull", self.base_url));
        if let Some(cursor) = since {
            request = request.query(&[("since", cursor)]);
        }

        let response = request.send().await.map_err(transport_error)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}
