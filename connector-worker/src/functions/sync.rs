use chrono::{TimeZone, Utc};
use elba_connect::elba::CanonicalUser;
use elba_connect::error::ErrorKind;
use elba_connect::event::{PipelineEvent, SyncRequested};
use elba_connect::organisation::{ConnectionState, LifecycleEvent, Organisation};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CallFailure, FunctionError, Pipeline};

/// What one sync run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The organisation is unauthorized; the vendor was not called.
    Skipped,
    /// A page was forwarded and the next page was requested.
    NextPage { users: usize, cursor: String },
    /// The last page was forwarded and stale users were removed.
    Completed { users: usize, deleted: u64 },
}

impl Pipeline {
    /// Forwards one page of vendor users to elba.
    ///
    /// Every page of one logical sync shares `sync_started_at`; the last page
    /// deletes the users elba has not seen since then. A run that fails for
    /// good leaves the organisation `idle` (or `unauthorized`).
    pub async fn sync_users(&self, job: &SyncRequested) -> Result<SyncOutcome, FunctionError> {
        let organisation = self.load(job.organisation_id)?;
        let id = organisation.id;

        match organisation.state {
            ConnectionState::Unauthorized => {
                info!(organisation_id = %id, "Organisation unauthorized, skipping sync");
                return Ok(SyncOutcome::Skipped);
            }
            state if !state.is_active() => {
                return Err(FunctionError::non_retriable(format!(
                    "organisation {} is {}",
                    id, state
                )));
            }
            _ => {}
        }

        self.store
            .transition(id, LifecycleEvent::SyncStarted)
            .map_err(FunctionError::internal)?;

        let result = self.sync_page(&organisation, job).await;
        if let Err(FunctionError::NonRetriable(message)) = &result {
            warn!(organisation_id = %id, error = %message, "Sync failed");
            self.sync_failed(id);
        }
        result
    }

    /// Leaves `syncing` after a sync that will not be retried.
    pub(super) fn sync_failed(&self, organisation_id: Uuid) {
        match self
            .store
            .transition(organisation_id, LifecycleEvent::SyncFailed)
        {
            Ok(Some(state)) => debug!(organisation_id = %organisation_id, state = %state, "Sync ended"),
            Ok(None) => {}
            Err(e) => {
                warn!(organisation_id = %organisation_id, error = %e, "Could not mark sync failed")
            }
        }
    }

    async fn sync_page(
        &self,
        organisation: &Organisation,
        job: &SyncRequested,
    ) -> Result<SyncOutcome, FunctionError> {
        let id = organisation.id;

        let credentials = match self.credentials(organisation, None).await {
            Ok(credentials) => credentials,
            Err(failure) => return Err(self.fail(organisation, failure).await),
        };

        let page = match self
            .vendor
            .list_users(&credentials.access_token, job.cursor.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                let mut failure = CallFailure::from(e);
                // The listing itself is gone: the installation no longer grants access.
                if failure.kind == ErrorKind::NotFound {
                    failure.kind = ErrorKind::Unauthorized;
                }
                return Err(self.fail(organisation, failure).await);
            }
        };

        let users = dedupe(page.users);
        let count = users.len();

        if !users.is_empty() {
            let counts = self
                .elba
                .update_users(id, &organisation.region, &users)
                .await
                .map_err(|e| FunctionError::from(CallFailure::from(e)))?;
            debug!(
                organisation_id = %id,
                received = counts.received,
                created = counts.created,
                updated = counts.updated,
                "Users forwarded to elba"
            );
        }

        let next_cursor = match page.next_cursor {
            Some(next) if job.cursor.as_deref() == Some(next.as_str()) => {
                warn!(organisation_id = %id, cursor = %next, "Vendor repeated the cursor, ending sync");
                None
            }
            next => next,
        };

        if let Some(cursor) = next_cursor {
            let next = SyncRequested {
                organisation_id: id,
                region: organisation.region.clone(),
                is_first_sync: job.is_first_sync,
                sync_started_at: job.sync_started_at,
                cursor: Some(cursor.clone()),
            };
            self.publish(PipelineEvent::new(next.into())).await?;

            info!(organisation_id = %id, users = count, "Sync page done, next page requested");
            return Ok(SyncOutcome::NextPage {
                users: count,
                cursor,
            });
        }

        let synced_before = Utc
            .timestamp_millis_opt(job.sync_started_at)
            .single()
            .ok_or_else(|| {
                FunctionError::non_retriable(format!(
                    "invalid syncStartedAt {}",
                    job.sync_started_at
                ))
            })?;

        let counts = self
            .elba
            .delete_users_synced_before(id, &organisation.region, synced_before)
            .await
            .map_err(|e| FunctionError::from(CallFailure::from(e)))?;

        if let Err(e) = self.store.transition(id, LifecycleEvent::SyncCompleted) {
            warn!(organisation_id = %id, error = %e, "Could not mark sync completed");
        }

        info!(
            organisation_id = %id,
            users = count,
            deleted = counts.deleted,
            "Sync completed"
        );

        Ok(SyncOutcome::Completed {
            users: count,
            deleted: counts.deleted,
        })
    }
}

/// Drops repeated user ids, keeping the first occurrence.
fn dedupe(users: Vec<CanonicalUser>) -> Vec<CanonicalUser> {
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|user| seen.insert(user.id.clone()))
        .collect()
}
