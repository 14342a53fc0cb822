use super::{authorize, parse_body, ApiError, AppState};
use crate::event::{AppInstalled, PipelineEvent};
use crate::organisation::{ConnectionState, Credentials, Organisation};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// POST /api/organisations
///
/// Installs an organisation whose credential is an API key, a pre-issued
/// token, or a credential broker connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallRequest {
    organisation_id: Uuid,
    region: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    nango_connection_id: Option<String>,
    #[serde(default)]
    vendor_ids: BTreeMap<String, String>,
}

impl InstallRequest {
    fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = non_blank(&self.access_token) {
            return Some(Credentials {
                access_token: token.to_string(),
                refresh_token: non_blank(&self.refresh_token).map(str::to_string),
                expires_at: self.expires_at,
            });
        }
        non_blank(&self.api_key).map(Credentials::api_key)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub organisation_id: Uuid,
    pub region: String,
    pub event_id: Uuid,
}

/// Organisation view returned by the API. Never includes tokens.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganisationSummary {
    pub organisation_id: Uuid,
    pub region: String,
    pub state: ConnectionState,
    pub has_credentials: bool,
    pub credentials_expire_at: Option<DateTime<Utc>>,
    pub nango_connection_id: Option<String>,
    pub vendor_ids: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Organisation> for OrganisationSummary {
    fn from(org: &Organisation) -> Self {
        Self {
            organisation_id: org.id,
            region: org.region.clone(),
            state: org.state,
            has_credentials: org.credentials.is_some(),
            credentials_expire_at: org.credentials.as_ref().and_then(|c| c.expires_at),
            nango_connection_id: org.nango_connection_id.clone(),
            vendor_ids: org.vendor_ids.clone(),
            created_at: org.created_at,
            updated_at: org.updated_at,
        }
    }
}

pub(super) fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/organisations", post(create_organisation))
        .route("/api/organisations/:id", get(get_organisation))
}

async fn create_organisation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<InstallResponse>), ApiError> {
    authorize(&state, &headers, &body)?;
    let request: InstallRequest = parse_body(&body)?;

    if request.organisation_id.is_nil() {
        return Err(ApiError::BadRequest(
            "organisationId must not be nil".to_string(),
        ));
    }
    if request.region.trim().is_empty() {
        return Err(ApiError::BadRequest("region is required".to_string()));
    }

    let credentials = request.credentials();
    let nango_connection_id = non_blank(&request.nango_connection_id).map(str::to_string);
    if credentials.is_none() && nango_connection_id.is_none() {
        return Err(ApiError::BadRequest(
            "One of apiKey, accessToken or nangoConnectionId is required".to_string(),
        ));
    }
    if nango_connection_id.is_some() && state.config.broker.is_none() {
        warn!(
            organisation_id = %request.organisation_id,
            "Broker connection given but no broker is configured; stored credentials will be used"
        );
    }

    let mut organisation = Organisation::new(request.organisation_id, request.region.clone());
    organisation.credentials = credentials;
    organisation.nango_connection_id = nango_connection_id;
    organisation.vendor_ids = request.vendor_ids;

    let response = complete_install(&state, organisation, &request.region).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_organisation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OrganisationSummary>, ApiError> {
    authorize(&state, &headers, &body)?;

    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid organisation id '{}'", id)))?;

    let organisation = state
        .store
        .get(id)
        .map_err(|e| {
            error!(organisation_id = %id, error = %e, "Failed to load organisation");
            ApiError::ServerError(format!("Failed to load organisation: {}", e))
        })?
        .ok_or_else(|| ApiError::NotFound(format!("Organisation '{}' not found", id)))?;

    Ok(Json(OrganisationSummary::from(&organisation)))
}

/// Persists the organisation and publishes `app.installed`.
///
/// Shared by the OAuth callback and the API install.
pub(super) async fn complete_install(
    state: &AppState,
    organisation: Organisation,
    region: &str,
) -> Result<InstallResponse, ApiError> {
    let id = organisation.id;

    let existing = state.store.get(id).map_err(|e| {
        error!(organisation_id = %id, error = %e, "Failed to load organisation");
        ApiError::ServerError(format!("Failed to load organisation: {}", e))
    })?;
    if let Some(existing) = existing {
        if existing.region != region {
            warn!(
                organisation_id = %id,
                stored = %existing.region,
                requested = %region,
                "Rejected install into a different region"
            );
            return Err(ApiError::Conflict(format!(
                "Organisation '{}' is installed in region '{}'",
                id, existing.region
            )));
        }
    }

    state.store.upsert(&organisation).map_err(|e| {
        error!(organisation_id = %id, error = %e, "Failed to store organisation");
        ApiError::ServerError(format!("Failed to store organisation: {}", e))
    })?;

    let event = PipelineEvent::new(
        AppInstalled {
            organisation_id: id,
            region: region.to_string(),
        }
        .into(),
    );
    let event_id = event.event_id;

    state.publisher.publish(event).await.map_err(|e| {
        error!(organisation_id = %id, error = %e, "Failed to publish app.installed");
        ApiError::ServerError(format!("Failed to publish install event: {}", e))
    })?;

    info!(organisation_id = %id, region = %region, "Organisation installed");

    Ok(InstallResponse {
        organisation_id: id,
        region: region.to_string(),
        event_id,
    })
}
