//! Inbound HTTP surface: elba webhooks, the install flow and organisation
//! management.

pub mod oauth;
mod organisations;
mod webhooks;

pub use oauth::{run_state_cleanup, StateManager};
pub use organisations::OrganisationSummary;
pub use webhooks::WebhookResponse;

use crate::auth::{verify_signature, SignatureError};
use crate::bus::EventPublisher;
use crate::config::SharedConfig;
use crate::organisation::OrganisationStore;
use crate::vendor::VendorClient;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared application state for every route.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub store: Arc<OrganisationStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub vendor: Arc<dyn VendorClient>,
    pub oauth_states: StateManager,
}

/// Create the full router with request tracing.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(webhooks::router())
        .merge(oauth::router())
        .merge(organisations::router())
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// API errors, rendered as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<SignatureError> for ApiError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::InvalidKey => ApiError::ServerError(e.to_string()),
            _ => ApiError::Unauthorized(e.to_string()),
        }
    }
}

/// Verifies the elba signature of a raw request body.
fn authorize(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    verify_signature(&state.config.server.webhook_secret, headers, body).map_err(|e| {
        warn!(error = %e, "Rejected unsigned or mis-signed request");
        ApiError::from(e)
    })
}

/// Parses a JSON body, mapping failures to 400.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Malformed request payload");
        ApiError::BadRequest(format!("Malformed payload: {}", e))
    })
}
