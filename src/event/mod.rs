use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::elba::ConnectionStatus;

mod validation;

pub use validation::ValidationError;

/// PipelineEvent is one typed unit of work travelling through the event bus.
///
/// The envelope carries identity and scheduling metadata; the body names the
/// function that handles it. Event ids are UUIDv7, so they sort by creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "eventId")]
    pub event_id: Uuid,

    /// Unix epoch milliseconds (producer time)
    pub timestamp: i64,

    /// Earliest time the event may be handled. `None` means immediately.
    #[serde(rename = "notBefore")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    pub event: EventBody,
}

/// Event name and data, serialized as `{"name": ..., "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum EventBody {
    #[serde(rename = "sync.requested")]
    SyncRequested(SyncRequested),
    #[serde(rename = "users.delete.requested")]
    UserDeleteRequested(UserDeleteRequested),
    #[serde(rename = "app.installed")]
    AppInstalled(AppInstalled),
    #[serde(rename = "app.uninstalled")]
    AppUninstalled(AppUninstalled),
    #[serde(rename = "token.refresh.requested")]
    TokenRefreshRequested(TokenRefreshRequested),
}

/// Which function handles an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Sync,
    Delete,
    Installed,
    Uninstalled,
    Refresh,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Sync => "sync.requested",
            EventKind::Delete => "users.delete.requested",
            EventKind::Installed => "app.installed",
            EventKind::Uninstalled => "app.uninstalled",
            EventKind::Refresh => "token.refresh.requested",
        }
    }
}

/// One page of a user sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequested {
    pub organisation_id: Uuid,
    pub region: String,
    pub is_first_sync: bool,
    /// Unix epoch milliseconds. Shared by every page of one logical sync.
    pub sync_started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleteRequested {
    pub organisation_id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nango_connection_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstalled {
    pub organisation_id: Uuid,
    pub region: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUninstalled {
    pub organisation_id: Uuid,
    pub region: String,
    /// Reported to elba. Defaults to `unauthorized` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshRequested {
    pub organisation_id: Uuid,
    pub region: String,
}

impl PipelineEvent {
    /// Wraps `event` in a fresh envelope stamped with the current time.
    pub fn new(event: EventBody) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp: Utc::now().timestamp_millis(),
            not_before: None,
            event,
        }
    }

    /// Delays handling until `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn kind(&self) -> EventKind {
        match &self.event {
            EventBody::SyncRequested(_) => EventKind::Sync,
            EventBody::UserDeleteRequested(_) => EventKind::Delete,
            EventBody::AppInstalled(_) => EventKind::Installed,
            EventBody::AppUninstalled(_) => EventKind::Uninstalled,
            EventBody::TokenRefreshRequested(_) => EventKind::Refresh,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The organisation every event is keyed by.
    pub fn organisation_id(&self) -> Uuid {
        match &self.event {
            EventBody::SyncRequested(e) => e.organisation_id,
            EventBody::UserDeleteRequested(e) => e.organisation_id,
            EventBody::AppInstalled(e) => e.organisation_id,
            EventBody::AppUninstalled(e) => e.organisation_id,
            EventBody::TokenRefreshRequested(e) => e.organisation_id,
        }
    }

    /// Checks the envelope and body before the event enters the bus.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}

impl From<SyncRequested> for EventBody {
    fn from(e: SyncRequested) -> Self {
        EventBody::SyncRequested(e)
    }
}

impl From<UserDeleteRequested> for EventBody {
    fn from(e: UserDeleteRequested) -> Self {
        EventBody::UserDeleteRequested(e)
    }
}

impl From<AppInstalled> for EventBody {
    fn from(e: AppInstalled) -> Self {
        EventBody::AppInstalled(e)
    }
}

impl From<AppUninstalled> for EventBody {
    fn from(e: AppUninstalled) -> Self {
        EventBody::AppUninstalled(e)
    }
}

impl From<TokenRefreshRequested> for EventBody {
    fn from(e: TokenRefreshRequested) -> Self {
        EventBody::TokenRefreshRequested(e)
    }
}
