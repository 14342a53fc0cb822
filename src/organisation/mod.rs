//! Organisations: one tenant's connection to the vendor.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       OrganisationStore                  │
//! │  - upsert / get / list / delete          │
//! │  - atomic credential + state updates     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!       (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher (AES-256-GCM)          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (organisations table)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The store is the only shared mutable resource of the pipeline. Credentials
//! are written by install/uninstall and the token refresh function; sync and
//! delete only read them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

mod encryption;
mod state;
mod storage;

pub use encryption::{Sealed, TokenCipher};
pub use state::{ConnectionState, LifecycleEvent, TransitionError};
pub use storage::OrganisationStore;

/// Vendor credentials for one organisation.
///
/// API-key vendors store the key as `access_token` with no refresh token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            access_token: key.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// True when the token can be refreshed and expires before `now + window`.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match (&self.expires_at, &self.refresh_token) {
            (Some(expires_at), Some(_)) => *expires_at <= now + window,
            _ => false,
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some() && self.expires_at.is_some()
    }
}

/// A tenant's connection to the vendor.
#[derive(Clone, Debug, PartialEq)]
pub struct Organisation {
    pub id: Uuid,
    /// Routing hint for the multi-region elba deployment. Immutable once set.
    pub region: String,
    /// Stored vendor credentials. `None` when a credential broker holds them.
    pub credentials: Option<Credentials>,
    /// Connection id at the credential broker, when one is used.
    pub nango_connection_id: Option<String>,
    /// Vendor-side identifiers (team id, tenant id, account id, ...).
    pub vendor_ids: BTreeMap<String, String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organisation {
    /// A freshly installed organisation, not yet through the lifecycle function.
    pub fn new(id: Uuid, region: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            region: region.into(),
            credentials: None,
            nango_connection_id: None,
            vendor_ids: BTreeMap::new(),
            state: ConnectionState::Uninstalled,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_nango_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.nango_connection_id = Some(connection_id.into());
        self
    }

    pub fn with_vendor_id(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vendor_ids.insert(key.into(), value.into());
        self
    }
}
