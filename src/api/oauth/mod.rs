//! OAuth 2.0 install flow.
//!
//! Implements the authorization code flow:
//! 1. elba sends the admin to GET /install?organisation_id=…&region=…
//! 2. Redirect to the vendor's authorization page with a CSRF state
//! 3. Vendor redirects to GET /oauth/callback?code=…&state=…
//! 4. Exchange code for tokens, store encrypted credentials
//! 5. Publish `app.installed`; the worker takes it from there

mod provider;
mod state_manager;

pub use state_manager::{run_state_cleanup, StateEntry, StateManager};

use super::organisations::{complete_install, InstallResponse};
use super::{ApiError, AppState};
use crate::organisation::Organisation;
use axum::{
    extract::{Query, State},
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// GET /install query parameters
#[derive(Deserialize)]
pub struct InstallQuery {
    organisation_id: Option<String>,
    region: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub(super) fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/install", get(install))
        .route("/oauth/callback", get(oauth_callback))
}

/// GET /install
///
/// Redirects to the vendor's authorization page. The state token is
/// single-use and expires after `server.oauth_state_expiry_secs`.
async fn install(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InstallQuery>,
) -> Result<Redirect, ApiError> {
    let organisation_id = query
        .organisation_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
        .filter(|id| !id.is_nil())
        .ok_or_else(|| {
            ApiError::BadRequest("Missing or invalid 'organisation_id' parameter".to_string())
        })?;
    let region = query
        .region
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'region' parameter".to_string()))?;

    let vendor = &state.config.vendor;
    if !vendor.supports_oauth() {
        error!("OAuth install requested but the vendor has no OAuth configuration");
        return Err(ApiError::ServerError(
            "OAuth install is not configured. Set VENDOR_AUTH_URL, VENDOR_TOKEN_URL and VENDOR_CLIENT_ID."
                .to_string(),
        ));
    }

    let csrf_state = state.oauth_states.create_state(organisation_id, &region);
    let auth_url = provider::authorization_url(
        vendor,
        &csrf_state,
        &state.config.server.redirect_uri(),
    );

    info!(organisation_id = %organisation_id, region = %region, "Redirecting to vendor authorization");

    Ok(Redirect::temporary(&auth_url))
}

/// GET /oauth/callback
///
/// Exchanges the authorization code and installs the organisation.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<InstallResponse>, ApiError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");
        return Err(ApiError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| ApiError::BadRequest("Missing 'state' parameter".to_string()))?;

    let entry = state
        .oauth_states
        .validate_and_consume(&csrf_state)
        .ok_or_else(|| {
            warn!(state = %csrf_state, "Invalid or expired OAuth state");
            ApiError::Unauthorized(
                "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
            )
        })?;

    debug!(organisation_id = %entry.organisation_id, "CSRF state validated, exchanging code");

    let credentials = state
        .vendor
        .exchange_code(&code, &state.config.server.redirect_uri())
        .await
        .map_err(|e| {
            error!(organisation_id = %entry.organisation_id, error = %e, "Token exchange failed");
            ApiError::BadGateway(format!("Failed to exchange authorization code: {}", e))
        })?;

    let has_refresh_token = credentials.refresh_token.is_some();
    let organisation = match load_existing(&state, entry.organisation_id)? {
        Some(mut existing) => {
            existing.credentials = Some(credentials);
            existing
        }
        None => Organisation::new(entry.organisation_id, entry.region.clone())
            .with_credentials(credentials),
    };

    let response = complete_install(&state, organisation, &entry.region).await?;

    info!(
        organisation_id = %entry.organisation_id,
        has_refresh_token,
        "OAuth install completed"
    );

    Ok(Json(response))
}

fn load_existing(state: &AppState, id: Uuid) -> Result<Option<Organisation>, ApiError> {
    state.store.get(id).map_err(|e| {
        error!(organisation_id = %id, error = %e, "Failed to load organisation");
        ApiError::ServerError(format!("Failed to load organisation: {}", e))
    })
}
