use chrono::Utc;
use elba_connect::elba::ConnectionStatus;
use elba_connect::event::{
    AppInstalled, AppUninstalled, PipelineEvent, SyncRequested, TokenRefreshRequested,
};
use elba_connect::organisation::LifecycleEvent;
use tracing::info;

use super::{CallFailure, FunctionError, Pipeline};

impl Pipeline {
    /// Activates a freshly installed organisation and starts its first sync.
    pub async fn install(&self, job: &AppInstalled) -> Result<(), FunctionError> {
        let organisation = self.load(job.organisation_id)?;
        let id = organisation.id;

        self.store
            .transition(id, LifecycleEvent::Install)
            .map_err(FunctionError::internal)?;

        self.elba
            .update_connection_status(id, &organisation.region, ConnectionStatus::Ok, None)
            .await
            .map_err(|e| FunctionError::from(CallFailure::from(e)))?;

        let first_sync = SyncRequested {
            organisation_id: id,
            region: organisation.region.clone(),
            is_first_sync: true,
            sync_started_at: Utc::now().timestamp_millis(),
            cursor: None,
        };
        self.publish(PipelineEvent::new(first_sync.into())).await?;

        let refreshable = organisation
            .credentials
            .as_ref()
            .is_some_and(|c| c.is_refreshable());
        if refreshable {
            let refresh = TokenRefreshRequested {
                organisation_id: id,
                region: organisation.region.clone(),
            };
            self.publish(PipelineEvent::new(refresh.into())).await?;
        }

        info!(
            organisation_id = %id,
            region = %organisation.region,
            refreshable,
            "Organisation installed"
        );
        Ok(())
    }

    /// Reports the disconnect to elba and forgets the organisation.
    pub async fn uninstall(&self, job: &AppUninstalled) -> Result<(), FunctionError> {
        let status = job.error_type.unwrap_or(ConnectionStatus::Unauthorized);

        self.elba
            .update_connection_status(
                job.organisation_id,
                &job.region,
                status,
                job.error_metadata.clone(),
            )
            .await
            .map_err(|e| FunctionError::from(CallFailure::from(e)))?;

        // No await between these two: a cancelled uninstall never leaves a
        // `removed` row behind.
        let existed = self
            .store
            .transition(job.organisation_id, LifecycleEvent::Uninstall)
            .map_err(FunctionError::internal)?
            .is_some();
        self.store
            .delete(job.organisation_id)
            .map_err(FunctionError::internal)?;

        info!(
            organisation_id = %job.organisation_id,
            status = ?status,
            existed,
            "Organisation uninstalled"
        );
        Ok(())
    }
}
