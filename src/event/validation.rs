use super::{EventBody, PipelineEvent};
use std::fmt;

/// Validation errors for PipelineEvent
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NilOrganisationId,
    MissingRegion,
    MissingUserId,
    InvalidTimestamp(i64),
    InvalidSyncStart(i64),
    EmptyCursor,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NilOrganisationId => write!(f, "organisationId must not be nil"),
            ValidationError::MissingRegion => write!(f, "region is required"),
            ValidationError::MissingUserId => write!(f, "userId is required"),
            ValidationError::InvalidTimestamp(ts) => {
                write!(f, "timestamp must be positive, got {}", ts)
            }
            ValidationError::InvalidSyncStart(ts) => {
                write!(f, "syncStartedAt must be positive, got {}", ts)
            }
            ValidationError::EmptyCursor => write!(f, "cursor must be omitted rather than empty"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validation rules:
/// - timestamp: positive Unix epoch milliseconds
/// - organisationId: never the nil UUID
/// - region: required wherever the event carries one (optional on deletes)
/// - userId: non-blank on deletes
/// - sync: positive syncStartedAt, cursor absent or non-empty
pub fn validate(event: &PipelineEvent) -> Result<(), ValidationError> {
    if event.timestamp <= 0 {
        return Err(ValidationError::InvalidTimestamp(event.timestamp));
    }

    if event.organisation_id().is_nil() {
        return Err(ValidationError::NilOrganisationId);
    }

    match &event.event {
        EventBody::SyncRequested(sync) => {
            require_region(&sync.region)?;
            if sync.sync_started_at <= 0 {
                return Err(ValidationError::InvalidSyncStart(sync.sync_started_at));
            }
            if sync.cursor.as_deref() == Some("") {
                return Err(ValidationError::EmptyCursor);
            }
        }
        EventBody::UserDeleteRequested(delete) => {
            if delete.user_id.trim().is_empty() {
                return Err(ValidationError::MissingUserId);
            }
            if let Some(region) = &delete.region {
                require_region(region)?;
            }
        }
        EventBody::AppInstalled(e) => require_region(&e.region)?,
        EventBody::AppUninstalled(e) => require_region(&e.region)?,
        EventBody::TokenRefreshRequested(e) => require_region(&e.region)?,
    }

    Ok(())
}

fn require_region(region: &str) -> Result<(), ValidationError> {
    if region.trim().is_empty() {
        Err(ValidationError::MissingRegion)
    } else {
        Ok(())
    }
}
