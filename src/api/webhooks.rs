use super::{authorize, parse_body, ApiError, AppState};
use crate::event::{AppUninstalled, PipelineEvent, SyncRequested, UserDeleteRequested};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// POST /webhooks/elba/users/delete-requested
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUsersRequested {
    organisation_id: Uuid,
    #[serde(default)]
    region: Option<String>,
    ids: Vec<String>,
    #[serde(default)]
    nango_connection_id: Option<String>,
}

/// POST /webhooks/elba/users/start-sync-requested
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSyncRequested {
    organisation_id: Uuid,
    region: String,
}

/// POST /webhooks/elba/organisation/uninstalled
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrganisationUninstalled {
    organisation_id: Uuid,
    region: String,
}

/// Ids of the events a webhook produced.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub published: usize,
    pub event_ids: Vec<Uuid>,
}

pub(super) fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/webhooks/elba/users/delete-requested",
            post(delete_users_requested),
        )
        .route(
            "/webhooks/elba/users/start-sync-requested",
            post(start_sync_requested),
        )
        .route(
            "/webhooks/elba/organisation/uninstalled",
            post(organisation_uninstalled),
        )
}

/// Fans out one `users.delete.requested` event per user id.
async fn delete_users_requested(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    authorize(&state, &headers, &body)?;
    let request: DeleteUsersRequested = parse_body(&body)?;

    let events = request
        .ids
        .iter()
        .map(|user_id| {
            PipelineEvent::new(
                UserDeleteRequested {
                    organisation_id: request.organisation_id,
                    user_id: user_id.clone(),
                    region: request.region.clone(),
                    nango_connection_id: request.nango_connection_id.clone(),
                }
                .into(),
            )
        })
        .collect::<Vec<_>>();

    info!(
        organisation_id = %request.organisation_id,
        count = events.len(),
        "User deletion requested"
    );

    publish(&state, events).await
}

async fn start_sync_requested(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    authorize(&state, &headers, &body)?;
    let request: StartSyncRequested = parse_body(&body)?;

    info!(organisation_id = %request.organisation_id, "Sync requested by elba");

    let event = PipelineEvent::new(
        SyncRequested {
            organisation_id: request.organisation_id,
            region: request.region,
            is_first_sync: false,
            sync_started_at: Utc::now().timestamp_millis(),
            cursor: None,
        }
        .into(),
    );
    publish(&state, vec![event]).await
}

async fn organisation_uninstalled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    authorize(&state, &headers, &body)?;
    let request: OrganisationUninstalled = parse_body(&body)?;

    info!(organisation_id = %request.organisation_id, "Organisation uninstalled in elba");

    let event = PipelineEvent::new(
        AppUninstalled {
            organisation_id: request.organisation_id,
            region: request.region,
            error_type: None,
            error_metadata: None,
        }
        .into(),
    );
    publish(&state, vec![event]).await
}

/// Validates every event before publishing any of them.
async fn publish(
    state: &AppState,
    events: Vec<PipelineEvent>,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    for event in &events {
        event.validate().map_err(|e| {
            warn!(error = %e, kind = event.name(), "Rejected webhook payload");
            ApiError::BadRequest(e.to_string())
        })?;
    }

    let event_ids = events.iter().map(|e| e.event_id).collect::<Vec<_>>();

    state.publisher.publish_all(events).await.map_err(|e| {
        error!(error = %e, "Failed to publish webhook events");
        ApiError::ServerError(format!("Failed to publish events: {}", e))
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            published: event_ids.len(),
            event_ids,
        }),
    ))
}
