// Shared fakes for the pipeline integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use connector_worker::Pipeline;
use elba_connect::bus::InMemoryPublisher;
use elba_connect::config::AppConfig;
use elba_connect::elba::{CanonicalUser, ConnectionStatus, ElbaApi, ElbaError, IngestionCounts};
use elba_connect::error::ErrorKind;
use elba_connect::organisation::{ConnectionState, Credentials, Organisation, OrganisationStore};
use elba_connect::vendor::{UserPage, VendorClient, VendorError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const ORG: &str = "00000000-0000-0000-0000-000000000002";

pub fn org_id() -> Uuid {
    Uuid::parse_str(ORG).unwrap()
}

pub fn user(id: &str) -> CanonicalUser {
    CanonicalUser {
        id: id.to_string(),
        display_name: format!("User {}", id),
        email: Some(format!("{}@example.com", id)),
        additional_emails: vec![],
    }
}

/// elba stand-in keeping users keyed by id, like the real ingestion API.
#[derive(Default)]
pub struct FakeElba {
    pub users: Mutex<BTreeMap<String, CanonicalUser>>,
    pub batches: Mutex<Vec<Vec<CanonicalUser>>>,
    pub synced_before: Mutex<Vec<DateTime<Utc>>>,
    pub statuses: Mutex<Vec<(Uuid, ConnectionStatus, Option<Value>)>>,
}

impl FakeElba {
    pub fn statuses(&self) -> Vec<(Uuid, ConnectionStatus, Option<Value>)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ElbaApi for FakeElba {
    async fn update_users(
        &self,
        _organisation_id: Uuid,
        _region: &str,
        users: &[CanonicalUser],
    ) -> Result<IngestionCounts, ElbaError> {
        let mut stored = self.users.lock().unwrap();
        let mut counts = IngestionCounts {
            received: users.len() as u64,
            ..Default::default()
        };
        for user in users {
            if stored.insert(user.id.clone(), user.clone()).is_some() {
                counts.updated += 1;
            } else {
                counts.created += 1;
            }
        }
        self.batches.lock().unwrap().push(users.to_vec());
        Ok(counts)
    }

    async fn delete_users_synced_before(
        &self,
        _organisation_id: Uuid,
        _region: &str,
        synced_before: DateTime<Utc>,
    ) -> Result<IngestionCounts, ElbaError> {
        self.synced_before.lock().unwrap().push(synced_before);
        Ok(IngestionCounts::default())
    }

    async fn update_connection_status(
        &self,
        organisation_id: Uuid,
        _region: &str,
        status: ConnectionStatus,
        error_metadata: Option<Value>,
    ) -> Result<(), ElbaError> {
        self.statuses
            .lock()
            .unwrap()
            .push((organisation_id, status, error_metadata));
        Ok(())
    }
}

/// Vendor stand-in with scripted pages and failures.
#[derive(Default)]
pub struct FakeVendor {
    /// Pages keyed by the cursor that requests them (`None` = first page).
    pub pages: Mutex<HashMap<Option<String>, UserPage>>,
    pub list_error: Mutex<Option<ErrorKind>>,
    /// Users the vendor still has; deleting anything else is a 404.
    pub existing_users: Mutex<Vec<String>>,
    pub delete_error: Mutex<Option<ErrorKind>>,
    /// Scripted refresh results, consumed in order. Empty means failure.
    pub refresh_results: Mutex<VecDeque<Credentials>>,
    pub list_calls: Mutex<Vec<Option<String>>>,
    pub delete_calls: Mutex<Vec<String>>,
    pub refresh_calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl FakeVendor {
    pub fn with_page(self, cursor: Option<&str>, users: &[&str], next: Option<&str>) -> Self {
        self.pages.lock().unwrap().insert(
            cursor.map(str::to_string),
            UserPage {
                users: users.iter().map(|id| user(id)).collect(),
                next_cursor: next.map(str::to_string),
            },
        );
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.lock().unwrap().len()
    }

    pub fn refresh_calls(&self) -> Vec<(String, tokio::time::Instant)> {
        self.refresh_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorClient for FakeVendor {
    async fn list_users(
        &self,
        _access_token: &str,
        cursor: Option<&str>,
    ) -> Result<UserPage, VendorError> {
        self.list_calls
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));

        if let Some(kind) = *self.list_error.lock().unwrap() {
            return Err(VendorError::new(kind, "scripted list failure"));
        }

        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&cursor.map(str::to_string))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_user(&self, _access_token: &str, user_id: &str) -> Result<(), VendorError> {
        self.delete_calls.lock().unwrap().push(user_id.to_string());

        if let Some(kind) = *self.delete_error.lock().unwrap() {
            return Err(VendorError::new(kind, "scripted delete failure"));
        }

        let mut existing = self.existing_users.lock().unwrap();
        match existing.iter().position(|id| id == user_id) {
            Some(index) => {
                existing.remove(index);
                Ok(())
            }
            None => Err(VendorError::new(ErrorKind::NotFound, "no such user")),
        }
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<Credentials, VendorError> {
        self.refresh_calls
            .lock()
            .unwrap()
            .push((refresh_token.to_string(), tokio::time::Instant::now()));

        self.refresh_results
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| VendorError::new(ErrorKind::MalformedPayload, "invalid_grant"))
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<Credentials, VendorError> {
        Err(VendorError::new(ErrorKind::Internal, "not used by the worker"))
    }
}

pub struct Harness {
    pub store: Arc<OrganisationStore>,
    pub elba: Arc<FakeElba>,
    pub vendor: Arc<FakeVendor>,
    pub publisher: InMemoryPublisher,
    pub pipeline: Arc<Pipeline>,
}

pub fn harness(vendor: FakeVendor) -> Harness {
    harness_with(vendor, AppConfig::default())
}

pub fn harness_with(vendor: FakeVendor, config: AppConfig) -> Harness {
    let key = BASE64.encode([3u8; 32]);
    let store = Arc::new(OrganisationStore::new(":memory:", &key).unwrap());
    let elba = Arc::new(FakeElba::default());
    let vendor = Arc::new(vendor);
    let publisher = InMemoryPublisher::new();

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        elba.clone(),
        vendor.clone(),
        Arc::new(publisher.clone()),
        Arc::new(config),
    ));

    Harness {
        store,
        elba,
        vendor,
        publisher,
        pipeline,
    }
}

/// Stores an organisation in `state` with an API-key credential.
pub fn seed_org(store: &OrganisationStore, state: ConnectionState) -> Organisation {
    let mut org = Organisation::new(org_id(), "eu").with_credentials(Credentials::api_key("key-1"));
    org.state = state;
    store.upsert(&org).unwrap();
    org
}

/// Stores an active organisation with an OAuth token expiring at `expires_at`.
pub fn seed_oauth_org(store: &OrganisationStore, expires_at: DateTime<Utc>) -> Organisation {
    let mut org = Organisation::new(org_id(), "eu").with_credentials(Credentials {
        access_token: "access-old".to_string(),
        refresh_token: Some("refresh-old".to_string()),
        expires_at: Some(expires_at),
    });
    org.state = ConnectionState::Idle;
    store.upsert(&org).unwrap();
    org
}
