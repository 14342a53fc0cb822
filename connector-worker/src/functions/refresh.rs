use chrono::{DateTime, Utc};
use elba_connect::event::{PipelineEvent, TokenRefreshRequested};
use elba_connect::organisation::{ConnectionState, Credentials};
use tracing::{debug, info, warn};

use super::{FunctionError, Pipeline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The token is still fresh; the check was rescheduled for `next_at`.
    NotDue { next_at: DateTime<Utc> },
    /// A new token pair was stored.
    Refreshed { expires_at: Option<DateTime<Utc>> },
    /// Nothing to refresh: API key, no expiry, or broker-managed tokens.
    NotRefreshable,
}

impl Pipeline {
    /// Keeps an organisation's access token ahead of its expiry.
    ///
    /// The vendor is called at most once per run. A failed refresh is retried
    /// no sooner than the configured refresh backoff.
    pub async fn refresh_token(
        &self,
        job: &TokenRefreshRequested,
    ) -> Result<RefreshOutcome, FunctionError> {
        let organisation = self.load(job.organisation_id)?;
        let id = organisation.id;

        if organisation.state == ConnectionState::Unauthorized {
            return Err(FunctionError::non_retriable(format!(
                "organisation {} is unauthorized",
                id
            )));
        }

        if organisation.nango_connection_id.is_some() && self.broker.is_some() {
            debug!(organisation_id = %id, "Broker manages tokens, nothing to refresh");
            return Ok(RefreshOutcome::NotRefreshable);
        }

        let Some(current) = organisation.credentials.filter(|c| c.is_refreshable()) else {
            return Ok(RefreshOutcome::NotRefreshable);
        };
        let (Some(refresh_token), Some(expires_at)) =
            (current.refresh_token.clone(), current.expires_at)
        else {
            return Ok(RefreshOutcome::NotRefreshable);
        };

        let window = self.config.functions.refresh_window();
        let now = Utc::now();

        if !current.expires_within(window, now) {
            let next_at = expires_at - window;
            self.schedule_refresh(job, next_at).await?;
            debug!(organisation_id = %id, next_at = %next_at, "Token not due for refresh");
            return Ok(RefreshOutcome::NotDue { next_at });
        }

        info!(organisation_id = %id, expires_at = %expires_at, "Refreshing vendor token");

        let fresh = match self.vendor.refresh_token(&refresh_token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                let backoff = self.config.functions.refresh_backoff();
                let retry_after = e.retry_after.map_or(backoff, |d| d.max(backoff));
                warn!(
                    organisation_id = %id,
                    kind = ?e.kind,
                    error = %e.message,
                    retry_in_secs = retry_after.as_secs(),
                    "Token refresh failed"
                );
                return Err(FunctionError::Retryable {
                    message: e.message,
                    retry_after: Some(retry_after),
                });
            }
        };

        // Keep the existing refresh token if the vendor did not rotate it
        let refreshed = Credentials {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or(Some(refresh_token)),
            expires_at: fresh.expires_at,
        };

        let stored = self
            .store
            .update_credentials(id, &refreshed)
            .map_err(FunctionError::internal)?;
        if !stored {
            info!(organisation_id = %id, "Organisation removed during refresh");
            return Err(FunctionError::Cancelled);
        }

        if let Some(expires_at) = refreshed.expires_at {
            self.schedule_refresh(job, expires_at - window).await?;
        }

        info!(
            organisation_id = %id,
            expires_at = ?refreshed.expires_at,
            "Vendor token refreshed"
        );

        Ok(RefreshOutcome::Refreshed {
            expires_at: refreshed.expires_at,
        })
    }

    async fn schedule_refresh(
        &self,
        job: &TokenRefreshRequested,
        at: DateTime<Utc>,
    ) -> Result<(), FunctionError> {
        let next = TokenRefreshRequested {
            organisation_id: job.organisation_id,
            region: job.region.clone(),
        };
        self.publish(PipelineEvent::new(next.into()).not_before(at))
            .await
    }
}
