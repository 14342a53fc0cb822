//! Credential broker (Nango).
//!
//! Organisations installed through Nango keep no tokens locally; every
//! function run asks the broker for the current credential instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::{retry_after, ErrorKind};
use crate::organisation::Credentials;

#[derive(Debug, Error)]
#[error("credential broker error ({kind:?}): {message}")]
pub struct BrokerError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl BrokerError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Resolves vendor credentials held by an external broker.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn get_credentials(&self, connection_id: &str) -> Result<Credentials, BrokerError>;
}

#[derive(Deserialize, Debug)]
struct ConnectionResponse {
    credentials: BrokerCredentials,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum BrokerCredentials {
    #[serde(rename = "OAUTH2")]
    OAuth2 {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "API_KEY")]
    ApiKey {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    #[serde(other)]
    Unsupported,
}

/// HTTP client for the Nango connection API.
pub struct NangoClient {
    http_client: Client,
    config: BrokerConfig,
}

impl NangoClient {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            http_client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl CredentialBroker for NangoClient {
    async fn get_credentials(&self, connection_id: &str) -> Result<Credentials, BrokerError> {
        let url = format!(
            "{}/connection/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(connection_id)
        );

        debug!(connection_id = %connection_id, "Fetching credentials from broker");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .query(&[("provider_config_key", self.config.integration_id.as_str())])
            .send()
            .await
            .map_err(|e| {
                BrokerError::new(
                    ErrorKind::from_transport(&e),
                    format!("Failed to reach credential broker: {}", e),
                )
            })?;

        let status = response.status();
        if let Some(kind) = ErrorKind::from_response(status, response.headers()) {
            let delay = retry_after(response.headers(), Utc::now());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            // A connection the broker no longer knows is as good as revoked.
            let kind = if kind == ErrorKind::NotFound {
                ErrorKind::Unauthorized
            } else {
                kind
            };
            return Err(BrokerError {
                kind,
                message: format!("status {}: {}", status, body),
                retry_after: delay,
            });
        }

        let connection: ConnectionResponse = response.json().await.map_err(|e| {
            BrokerError::new(
                ErrorKind::MalformedPayload,
                format!("Failed to parse broker connection: {}", e),
            )
        })?;

        match connection.credentials {
            BrokerCredentials::OAuth2 {
                access_token,
                refresh_token,
                expires_at,
            } => Ok(Credentials {
                access_token,
                refresh_token,
                expires_at,
            }),
            BrokerCredentials::ApiKey { api_key } => Ok(Credentials::api_key(api_key)),
            BrokerCredentials::Unsupported => Err(BrokerError::new(
                ErrorKind::MalformedPayload,
                "Unsupported broker credential type",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(base_url: String) -> NangoClient {
        NangoClient::new(BrokerConfig {
            base_url,
            integration_id: "slack".to_string(),
            secret_key: "nango-secret".to_string(),
        })
    }

    #[tokio::test]
    async fn test_oauth_connection() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/connection/conn-1")
            .match_header("authorization", "Bearer nango-secret")
            .match_query(Matcher::UrlEncoded(
                "provider_config_key".into(),
                "slack".into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"id":7,"credentials":{"type":"OAUTH2","access_token":"xoxb-1","refresh_token":"r-1","expires_at":"2030-01-01T00:00:00Z","raw":{}}}"#,
            )
            .create_async()
            .await;

        let creds = client(server.url()).get_credentials("conn-1").await.unwrap();
        assert_eq!(creds.access_token, "xoxb-1");
        assert_eq!(creds.refresh_token.as_deref(), Some("r-1"));
        assert!(creds.expires_at.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_key_connection() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/connection/conn-2")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"credentials":{"type":"API_KEY","apiKey":"key-1"}}"#)
            .create_async()
            .await;

        let creds = client(server.url()).get_credentials("conn-2").await.unwrap();
        assert_eq!(creds, Credentials::api_key("key-1"));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_unauthorized() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/connection/gone")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let err = client(server.url()).get_credentials("gone").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_unsupported_credential_type() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/connection/basic")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"credentials":{"type":"BASIC","username":"u","password":"p"}}"#)
            .create_async()
            .await;

        let err = client(server.url()).get_credentials("basic").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedPayload);
    }
}
