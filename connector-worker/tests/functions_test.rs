// Integration tests for the pipeline functions against in-memory fakes

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use connector_worker::functions::{DeleteOutcome, RefreshOutcome, SyncOutcome};
use connector_worker::{FunctionError, JobHandler};
use elba_connect::config::AppConfig;
use elba_connect::elba::ConnectionStatus;
use elba_connect::error::ErrorKind;
use elba_connect::event::{
    AppInstalled, AppUninstalled, EventBody, EventKind, PipelineEvent, SyncRequested,
    TokenRefreshRequested, UserDeleteRequested,
};
use elba_connect::organisation::{ConnectionState, Credentials, Organisation};
use serde_json::json;
use uuid::Uuid;

fn sync_job(cursor: Option<&str>, started_at: i64) -> SyncRequested {
    SyncRequested {
        organisation_id: org_id(),
        region: "eu".to_string(),
        is_first_sync: false,
        sync_started_at: started_at,
        cursor: cursor.map(str::to_string),
    }
}

fn delete_job(user_id: &str) -> UserDeleteRequested {
    UserDeleteRequested {
        organisation_id: org_id(),
        user_id: user_id.to_string(),
        region: None,
        nango_connection_id: None,
    }
}

fn refresh_job() -> TokenRefreshRequested {
    TokenRefreshRequested {
        organisation_id: org_id(),
        region: "eu".to_string(),
    }
}

// --- sync ---

#[tokio::test]
async fn test_sync_follows_cursor_and_completes() {
    let vendor = FakeVendor::default()
        .with_page(None, &["u1", "u2"], Some("page-2"))
        .with_page(Some("page-2"), &["u3"], None);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);
    let started_at = 1_700_000_000_000;

    let outcome = h.pipeline.sync_users(&sync_job(None, started_at)).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::NextPage {
            users: 2,
            cursor: "page-2".to_string()
        }
    );
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Syncing
    );

    let follow_up = h.publisher.take();
    assert_eq!(follow_up.len(), 1);
    let EventBody::SyncRequested(next) = &follow_up[0].event else {
        panic!("expected a sync page, got {:?}", follow_up[0]);
    };
    assert_eq!(next.cursor.as_deref(), Some("page-2"));
    assert_eq!(next.sync_started_at, started_at);

    let outcome = h.pipeline.sync_users(next).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { users: 1, deleted: 0 });
    assert!(h.publisher.is_empty());

    assert_eq!(h.elba.user_ids(), vec!["u1", "u2", "u3"]);
    assert_eq!(
        *h.elba.synced_before.lock().unwrap(),
        vec![Utc.timestamp_millis_opt(started_at).unwrap()]
    );
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Idle
    );
}

#[tokio::test]
async fn test_unauthorized_organisation_emits_no_pages() {
    let vendor = FakeVendor::default().with_page(None, &["u1"], Some("page-2"));
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Unauthorized);

    let outcome = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Skipped);
    assert_eq!(h.vendor.list_calls(), 0);
    assert!(h.publisher.is_empty());
    assert!(h.elba.user_ids().is_empty());
}

#[tokio::test]
async fn test_auth_failure_stops_sync_until_reinstall() {
    let vendor = FakeVendor::default().with_page(None, &["u1"], Some("page-2"));
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::Unauthorized);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Unauthorized
    );
    assert_eq!(
        h.elba.statuses(),
        vec![(org_id(), ConnectionStatus::Unauthorized, None)]
    );

    // A later sync request does not reach the vendor.
    *h.vendor.list_error.lock().unwrap() = None;
    let outcome = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_001))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped);
    assert_eq!(h.vendor.list_calls(), 1);
    assert!(h.publisher.is_empty());
}

#[tokio::test]
async fn test_not_admin_is_reported() {
    let vendor = FakeVendor::default();
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::NotAdmin);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Installed);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(
        h.elba.statuses(),
        vec![(org_id(), ConnectionStatus::NotAdmin, None)]
    );
}

#[tokio::test]
async fn test_rate_limited_sync_is_retried() {
    let vendor = FakeVendor::default();
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::RateLimited);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(h.elba.statuses().is_empty());
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Syncing
    );
}

#[tokio::test]
async fn test_missing_listing_marks_organisation_unauthorized() {
    let vendor = FakeVendor::default().with_page(None, &["u1"], None);
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::NotFound);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Unauthorized
    );
    assert_eq!(
        h.elba.statuses(),
        vec![(org_id(), ConnectionStatus::Unauthorized, None)]
    );

    *h.vendor.list_error.lock().unwrap() = None;
    let outcome = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_001))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped);
    assert_eq!(h.vendor.list_calls(), 1);
}

#[tokio::test]
async fn test_malformed_page_returns_organisation_to_idle() {
    let vendor = FakeVendor::default();
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::MalformedPayload);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Installed);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();

    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert!(h.elba.statuses().is_empty());
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Idle
    );
}

#[tokio::test]
async fn test_exhausted_sync_returns_organisation_to_idle() {
    let vendor = FakeVendor::default();
    *vendor.list_error.lock().unwrap() = Some(ErrorKind::TransientNetwork);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);
    let job = sync_job(None, 1_700_000_000_000);

    let err = h.pipeline.sync_users(&job).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Syncing
    );

    h.pipeline
        .exhausted(&PipelineEvent::new(job.into()), &err)
        .await;

    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Idle
    );
    assert!(h.elba.statuses().is_empty());
}

#[tokio::test]
async fn test_repeated_cursor_ends_sync() {
    let vendor = FakeVendor::default().with_page(Some("page-2"), &["u3"], Some("page-2"));
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let outcome = h
        .pipeline
        .sync_users(&sync_job(Some("page-2"), 1_700_000_000_000))
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::Completed { users: 1, deleted: 0 });
    assert!(h.publisher.is_empty());
    assert_eq!(h.elba.synced_before.lock().unwrap().len(), 1);
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Idle
    );
}

#[tokio::test]
async fn test_replaying_a_page_creates_no_duplicates() {
    let vendor = FakeVendor::default().with_page(None, &["u1", "u2", "u1"], None);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);
    let job = sync_job(None, 1_700_000_000_000);

    h.pipeline.sync_users(&job).await.unwrap();
    h.pipeline.sync_users(&job).await.unwrap();

    assert_eq!(h.elba.user_ids(), vec!["u1", "u2"]);
    let batches = h.elba.batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|batch| batch.len() == 2));
}

#[tokio::test]
async fn test_sync_of_unknown_organisation_is_dropped() {
    let h = harness(FakeVendor::default());

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();

    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert_eq!(h.vendor.list_calls(), 0);
}

// --- delete ---

#[tokio::test]
async fn test_delete_twice_is_harmless() {
    let vendor = FakeVendor::default();
    vendor
        .existing_users
        .lock()
        .unwrap()
        .push("00000000-0000-0000-0000-000000000001".to_string());
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);
    let job = delete_job("00000000-0000-0000-0000-000000000001");

    assert_eq!(h.pipeline.delete_user(&job).await.unwrap(), DeleteOutcome::Deleted);
    assert_eq!(
        h.pipeline.delete_user(&job).await.unwrap(),
        DeleteOutcome::AlreadyGone
    );

    assert!(h.vendor.existing_users.lock().unwrap().is_empty());
    assert_eq!(h.vendor.delete_calls.lock().unwrap().len(), 2);
    assert!(h.elba.statuses().is_empty());
}

#[tokio::test]
async fn test_delete_auth_failure_marks_unauthorized() {
    let vendor = FakeVendor::default();
    *vendor.delete_error.lock().unwrap() = Some(ErrorKind::Unauthorized);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let err = h.pipeline.delete_user(&delete_job("u1")).await.unwrap_err();

    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Unauthorized
    );
    assert_eq!(h.elba.statuses().len(), 1);
}

#[tokio::test]
async fn test_delete_transient_failure_is_retryable() {
    let vendor = FakeVendor::default();
    *vendor.delete_error.lock().unwrap() = Some(ErrorKind::TransientNetwork);
    let h = harness(vendor);
    seed_org(&h.store, ConnectionState::Idle);

    let err = h.pipeline.delete_user(&delete_job("u1")).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Idle
    );
}

// --- lifecycle ---

#[tokio::test]
async fn test_install_starts_first_sync_and_refresh() {
    let h = harness(FakeVendor::default());
    let org = Organisation::new(org_id(), "eu").with_credentials(Credentials {
        access_token: "a".to_string(),
        refresh_token: Some("r".to_string()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    });
    h.store.upsert(&org).unwrap();

    h.pipeline
        .install(&AppInstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        h.store.get(org_id()).unwrap().unwrap().state,
        ConnectionState::Installed
    );
    assert_eq!(h.elba.statuses(), vec![(org_id(), ConnectionStatus::Ok, None)]);

    let syncs = h.publisher.events_of(EventKind::Sync);
    assert_eq!(syncs.len(), 1);
    match &syncs[0].event {
        EventBody::SyncRequested(sync) => {
            assert!(sync.is_first_sync);
            assert!(sync.cursor.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.publisher.events_of(EventKind::Refresh).len(), 1);
}

#[tokio::test]
async fn test_install_with_api_key_has_no_refresh() {
    let h = harness(FakeVendor::default());
    seed_org(&h.store, ConnectionState::Uninstalled);

    h.pipeline
        .install(&AppInstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(h.publisher.events_of(EventKind::Sync).len(), 1);
    assert!(h.publisher.events_of(EventKind::Refresh).is_empty());
}

#[tokio::test]
async fn test_reinstall_recovers_unauthorized() {
    let h = harness(FakeVendor::default().with_page(None, &["u1"], None));
    seed_org(&h.store, ConnectionState::Unauthorized);

    h.pipeline
        .install(&AppInstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
        })
        .await
        .unwrap();

    let outcome = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { users: 1, deleted: 0 });
}

#[tokio::test]
async fn test_uninstall_reports_and_removes() {
    let h = harness(FakeVendor::default());
    seed_org(&h.store, ConnectionState::Idle);

    h.pipeline
        .uninstall(&AppUninstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
            error_type: None,
            error_metadata: None,
        })
        .await
        .unwrap();

    assert_eq!(
        h.elba.statuses(),
        vec![(org_id(), ConnectionStatus::Unauthorized, None)]
    );
    assert!(h.store.get(org_id()).unwrap().is_none());
}

#[tokio::test]
async fn test_uninstall_completes_a_removed_organisation() {
    let h = harness(FakeVendor::default().with_page(None, &["u1"], None));
    seed_org(&h.store, ConnectionState::Removed);

    let err = h
        .pipeline
        .sync_users(&sync_job(None, 1_700_000_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, FunctionError::NonRetriable(_)));
    assert_eq!(h.vendor.list_calls(), 0);

    h.pipeline
        .uninstall(&AppUninstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
            error_type: None,
            error_metadata: None,
        })
        .await
        .unwrap();

    assert!(h.store.get(org_id()).unwrap().is_none());
    assert_eq!(h.elba.statuses().len(), 1);
}

#[tokio::test]
async fn test_uninstall_forwards_error_type_and_metadata() {
    let h = harness(FakeVendor::default());
    seed_org(&h.store, ConnectionState::Idle);
    let metadata = json!({"reason": "scope revoked"});

    h.pipeline
        .uninstall(&AppUninstalled {
            organisation_id: org_id(),
            region: "eu".to_string(),
            error_type: Some(ConnectionStatus::NotAdmin),
            error_metadata: Some(metadata.clone()),
        })
        .await
        .unwrap();

    assert_eq!(
        h.elba.statuses(),
        vec![(org_id(), ConnectionStatus::NotAdmin, Some(metadata))]
    );
}

// --- scheduling ---

#[tokio::test]
async fn test_schedule_with_no_organisations() {
    let h = harness(FakeVendor::default());

    let report = h.pipeline.schedule_syncs().await.unwrap();

    assert_eq!(report.organisations, 0);
    assert!(h.publisher.is_empty());
}

#[tokio::test]
async fn test_schedule_skips_unauthorized() {
    let h = harness(FakeVendor::default());
    seed_org(&h.store, ConnectionState::Idle);
    let mut locked = Organisation::new(Uuid::now_v7(), "us");
    locked.state = ConnectionState::Unauthorized;
    h.store.upsert(&locked).unwrap();

    let report = h.pipeline.schedule_syncs().await.unwrap();

    assert_eq!(report.organisations, 1);
    let events = h.publisher.events_of(EventKind::Sync);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].organisation_id(), org_id());
}

#[tokio::test]
async fn test_resume_refreshes_only_for_expiring_tokens() {
    let h = harness(FakeVendor::default());
    seed_oauth_org(&h.store, Utc::now() + Duration::hours(2));
    let mut api_key_org = Organisation::new(Uuid::now_v7(), "eu")
        .with_credentials(Credentials::api_key("key"));
    api_key_org.state = ConnectionState::Idle;
    h.store.upsert(&api_key_org).unwrap();

    assert_eq!(h.pipeline.resume_refreshes().await.unwrap(), 1);
    let events = h.publisher.events_of(EventKind::Refresh);
    assert_eq!(events[0].organisation_id(), org_id());
}

// --- token refresh ---

#[tokio::test]
async fn test_refresh_due_token_calls_vendor_once() {
    let vendor = FakeVendor::default();
    let new_expiry = Utc::now() + Duration::hours(1);
    vendor.refresh_results.lock().unwrap().push_back(Credentials {
        access_token: "access-new".to_string(),
        refresh_token: None,
        expires_at: Some(new_expiry),
    });
    let h = harness(vendor);
    seed_oauth_org(&h.store, Utc::now() + Duration::minutes(10));

    let outcome = h.pipeline.refresh_token(&refresh_job()).await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Refreshed {
            expires_at: Some(new_expiry)
        }
    );

    let calls = h.vendor.refresh_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "refresh-old");

    let creds = h.store.get(org_id()).unwrap().unwrap().credentials.unwrap();
    assert_eq!(creds.access_token, "access-new");
    // The vendor did not rotate the refresh token.
    assert_eq!(creds.refresh_token.as_deref(), Some("refresh-old"));
    assert_eq!(creds.expires_at, Some(new_expiry));

    let next = h.publisher.events_of(EventKind::Refresh);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].not_before, Some(new_expiry - Duration::minutes(30)));
}

#[tokio::test]
async fn test_refresh_not_due_reschedules() {
    let h = harness(FakeVendor::default());
    let expires_at = Utc::now() + Duration::hours(2);
    seed_oauth_org(&h.store, expires_at);

    let outcome = h.pipeline.refresh_token(&refresh_job()).await.unwrap();

    let next_at = expires_at - Duration::minutes(30);
    assert_eq!(outcome, RefreshOutcome::NotDue { next_at });
    assert!(h.vendor.refresh_calls().is_empty());
    let next = h.publisher.events_of(EventKind::Refresh);
    assert_eq!(next[0].not_before, Some(next_at));
}

#[tokio::test]
async fn test_refresh_failure_waits_for_backoff() {
    let h = harness(FakeVendor::default());
    seed_oauth_org(&h.store, Utc::now() + Duration::minutes(10));

    let err = h.pipeline.refresh_token(&refresh_job()).await.unwrap_err();

    assert!(err.is_retryable());
    assert!(err.retry_after().unwrap() >= std::time::Duration::from_secs(15 * 60));
    let creds = h.store.get(org_id()).unwrap().unwrap().credentials.unwrap();
    assert_eq!(creds.access_token, "access-old");
    assert!(h.publisher.is_empty());
}

#[tokio::test]
async fn test_refresh_skips_api_keys() {
    let mut config = AppConfig::default();
    config.functions.refresh_window_secs = 3600;
    let h = harness_with(FakeVendor::default(), config);
    seed_org(&h.store, ConnectionState::Idle);

    let outcome = h.pipeline.refresh_token(&refresh_job()).await.unwrap();

    assert_eq!(outcome, RefreshOutcome::NotRefreshable);
    assert!(h.vendor.refresh_calls().is_empty());
    assert!(h.publisher.is_empty());
}
