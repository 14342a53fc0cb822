use chrono::Utc;
use elba_connect::event::{PipelineEvent, SyncRequested, TokenRefreshRequested};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use super::{FunctionError, Pipeline};

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Organisations a sync was requested for.
    pub organisations: usize,
}

impl Pipeline {
    /// Requests a sync for every active organisation.
    ///
    /// Unauthorized organisations stay untouched until they are reinstalled.
    pub async fn schedule_syncs(&self) -> Result<ScheduleReport, FunctionError> {
        let organisations = self.store.list().map_err(FunctionError::internal)?;
        let sync_started_at = Utc::now().timestamp_millis();

        let events: Vec<PipelineEvent> = organisations
            .iter()
            .filter(|org| org.state.is_active())
            .map(|org| {
                PipelineEvent::new(
                    SyncRequested {
                        organisation_id: org.id,
                        region: org.region.clone(),
                        is_first_sync: false,
                        sync_started_at,
                        cursor: None,
                    }
                    .into(),
                )
            })
            .collect();

        let report = ScheduleReport {
            organisations: events.len(),
        };

        self.publisher
            .publish_all(events)
            .await
            .map_err(FunctionError::internal)?;

        info!(
            organisations = report.organisations,
            skipped = organisations.len() - report.organisations,
            "Scheduled syncs"
        );
        Ok(report)
    }

    /// Restarts the refresh chain of every organisation holding an
    /// expiring credential. Called once on worker start.
    ///
    /// Returns the number of refresh requests published.
    pub async fn resume_refreshes(&self) -> Result<usize, FunctionError> {
        let organisations = self.store.list().map_err(FunctionError::internal)?;

        let events: Vec<PipelineEvent> = organisations
            .iter()
            .filter(|org| org.state.is_active())
            .filter(|org| org.credentials.as_ref().is_some_and(|c| c.is_refreshable()))
            .map(|org| {
                PipelineEvent::new(
                    TokenRefreshRequested {
                        organisation_id: org.id,
                        region: org.region.clone(),
                    }
                    .into(),
                )
            })
            .collect();

        let count = events.len();
        self.publisher
            .publish_all(events)
            .await
            .map_err(FunctionError::internal)?;

        info!(count, "Resumed token refreshes");
        Ok(count)
    }

    /// Runs [`Pipeline::schedule_syncs`] every `sync.interval_secs`.
    pub fn start_scheduler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.sync.interval_secs.max(1));

        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Starting sync scheduler");
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;
                if let Err(e) = self.schedule_syncs().await {
                    error!(error = %e, "Sync scheduling failed");
                }
            }
        })
    }
}
