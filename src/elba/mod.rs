//! elba ingestion API client.
//!
//! Users are upserted by id, so replaying a batch never duplicates records.
//! A sync ends with a delete of every user not seen since the sync started.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::error::{retry_after, ErrorKind};

/// Reported health of an organisation's vendor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Ok,
    Unauthorized,
    NotAdmin,
    InternalError,
}

impl ConnectionStatus {
    /// The `errorType` sent to elba; `None` clears the error.
    pub fn error_type(self) -> Option<&'static str> {
        match self {
            ConnectionStatus::Ok => None,
            ConnectionStatus::Unauthorized => Some("unauthorized"),
            ConnectionStatus::NotAdmin => Some("not_admin"),
            ConnectionStatus::InternalError => Some("internal_error"),
        }
    }
}

/// The normalized user shape sent to elba regardless of vendor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalUser {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub additional_emails: Vec<String>,
}

/// Counts reported by elba for one ingestion call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCounts {
    #[serde(default)]
    pub received: u64,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Debug, Error)]
#[error("elba API error ({kind:?}): {message}")]
pub struct ElbaError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

/// Operations the pipeline performs against elba.
#[async_trait]
pub trait ElbaApi: Send + Sync {
    /// Upserts a batch of users for one organisation.
    async fn update_users(
        &self,
        organisation_id: Uuid,
        region: &str,
        users: &[CanonicalUser],
    ) -> Result<IngestionCounts, ElbaError>;

    /// Deletes every user last seen before `synced_before`.
    async fn delete_users_synced_before(
        &self,
        organisation_id: Uuid,
        region: &str,
        synced_before: DateTime<Utc>,
    ) -> Result<IngestionCounts, ElbaError>;

    /// Updates the connection status shown in the elba dashboard.
    async fn update_connection_status(
        &self,
        organisation_id: Uuid,
        region: &str,
        status: ConnectionStatus,
        error_metadata: Option<Value>,
    ) -> Result<(), ElbaError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUsersBody<'a> {
    organisation_id: Uuid,
    users: &'a [CanonicalUser],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUsersBody {
    organisation_id: Uuid,
    synced_before: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatusBody {
    organisation_id: Uuid,
    error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_metadata: Option<Value>,
}

/// HTTP client for the elba API.
///
/// Authenticates with a bearer API key and routes by `X-elba-Region`.
pub struct ElbaClient {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl ElbaClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, region: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("X-elba-Region", region)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ElbaError> {
        let response = request.send().await.map_err(|e| ElbaError {
            kind: ErrorKind::from_transport(&e),
            message: format!("Failed to reach elba: {}", e),
            retry_after: None,
        })?;

        let status = response.status();
        if let Some(kind) = ErrorKind::from_response(status, response.headers()) {
            let retry_after = retry_after(response.headers(), Utc::now());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(ElbaError {
                kind,
                message: format!("status {}: {}", status, body),
                retry_after,
            });
        }

        Ok(response)
    }

    async fn counts(response: reqwest::Response) -> Result<IngestionCounts, ElbaError> {
        let body = response.text().await.map_err(|e| ElbaError {
            kind: ErrorKind::TransientNetwork,
            message: format!("Failed to read elba response: {}", e),
            retry_after: None,
        })?;
        if body.trim().is_empty() {
            return Ok(IngestionCounts::default());
        }
        serde_json::from_str(&body).map_err(|e| ElbaError {
            kind: ErrorKind::MalformedPayload,
            message: format!("Failed to parse elba response: {}", e),
            retry_after: None,
        })
    }
}

#[async_trait]
impl ElbaApi for ElbaClient {
    async fn update_users(
        &self,
        organisation_id: Uuid,
        region: &str,
        users: &[CanonicalUser],
    ) -> Result<IngestionCounts, ElbaError> {
        debug!(organisation_id = %organisation_id, count = users.len(), "Sending users to elba");
        let request = self
            .request(reqwest::Method::POST, "/users", region)
            .json(&UpdateUsersBody {
                organisation_id,
                users,
            });
        Self::counts(self.send(request).await?).await
    }

    async fn delete_users_synced_before(
        &self,
        organisation_id: Uuid,
        region: &str,
        synced_before: DateTime<Utc>,
    ) -> Result<IngestionCounts, ElbaError> {
        let request = self
            .request(reqwest::Method::DELETE, "/users", region)
            .json(&DeleteUsersBody {
                organisation_id,
                synced_before,
            });
        Self::counts(self.send(request).await?).await
    }

    async fn update_connection_status(
        &self,
        organisation_id: Uuid,
        region: &str,
        status: ConnectionStatus,
        error_metadata: Option<Value>,
    ) -> Result<(), ElbaError> {
        let request = self
            .request(reqwest::Method::PATCH, "/connection-status", region)
            .json(&ConnectionStatusBody {
                organisation_id,
                error_type: status.error_type(),
                error_metadata,
            });
        self.send(request).await?;
        Ok(())
    }
}
