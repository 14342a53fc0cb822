//! Pipeline functions: one handler per event name.
//!
//! ```text
//! sync.requested          -> sync_users        (one vendor page per run)
//! users.delete.requested  -> delete_user
//! app.installed           -> install
//! app.uninstalled         -> uninstall
//! token.refresh.requested -> refresh_token
//! (interval)              -> schedule_syncs
//! ```
//!
//! Every function is safe to run more than once for the same event. Failures
//! are reported as [`FunctionError`] and the [`crate::queue::JobQueue`] decides
//! whether another attempt happens.

mod delete;
mod lifecycle;
mod refresh;
mod schedule;
mod sync;

pub use delete::DeleteOutcome;
pub use refresh::RefreshOutcome;
pub use schedule::ScheduleReport;
pub use sync::SyncOutcome;

use async_trait::async_trait;
use elba_connect::broker::{BrokerError, CredentialBroker};
use elba_connect::bus::EventPublisher;
use elba_connect::config::SharedConfig;
use elba_connect::elba::{ConnectionStatus, ElbaApi, ElbaError};
use elba_connect::error::ErrorKind;
use elba_connect::event::{EventBody, PipelineEvent};
use elba_connect::organisation::{
    ConnectionState, Credentials, LifecycleEvent, Organisation, OrganisationStore,
};
use elba_connect::vendor::{VendorClient, VendorError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::JobHandler;

/// Outcome of a failed function run.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// Worth another attempt, no sooner than `retry_after` when given.
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Dropped after logging.
    #[error("non-retriable: {0}")]
    NonRetriable(String),
    /// Superseded by a later lifecycle event for the same organisation.
    #[error("cancelled")]
    Cancelled,
}

impl FunctionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        FunctionError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn non_retriable(message: impl Into<String>) -> Self {
        FunctionError::NonRetriable(message.into())
    }

    /// Store and publisher failures are plumbing: retry the whole run.
    fn internal(err: anyhow::Error) -> Self {
        FunctionError::retryable(format!("{:#}", err))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FunctionError::Retryable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FunctionError::Retryable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A classified failure of an outbound call (vendor, broker or elba).
#[derive(Debug)]
struct CallFailure {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl From<VendorError> for CallFailure {
    fn from(e: VendorError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
            retry_after: e.retry_after,
        }
    }
}

impl From<BrokerError> for CallFailure {
    fn from(e: BrokerError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
            retry_after: e.retry_after,
        }
    }
}

impl From<ElbaError> for CallFailure {
    fn from(e: ElbaError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
            retry_after: e.retry_after,
        }
    }
}

impl From<CallFailure> for FunctionError {
    fn from(f: CallFailure) -> Self {
        if f.kind.is_retryable() {
            FunctionError::Retryable {
                message: f.message,
                retry_after: f.retry_after,
            }
        } else {
            FunctionError::NonRetriable(f.message)
        }
    }
}

/// Everything a function run needs, shared by all runs.
pub struct Pipeline {
    store: Arc<OrganisationStore>,
    elba: Arc<dyn ElbaApi>,
    vendor: Arc<dyn VendorClient>,
    broker: Option<Arc<dyn CredentialBroker>>,
    publisher: Arc<dyn EventPublisher>,
    config: SharedConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<OrganisationStore>,
        elba: Arc<dyn ElbaApi>,
        vendor: Arc<dyn VendorClient>,
        publisher: Arc<dyn EventPublisher>,
        config: SharedConfig,
    ) -> Self {
        Self {
            store,
            elba,
            vendor,
            broker: None,
            publisher,
            config,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn store(&self) -> &Arc<OrganisationStore> {
        &self.store
    }

    /// Runs the function matching the event's name.
    pub async fn dispatch(&self, event: &PipelineEvent) -> Result<(), FunctionError> {
        match &event.event {
            EventBody::SyncRequested(job) => self.sync_users(job).await.map(|_| ()),
            EventBody::UserDeleteRequested(job) => self.delete_user(job).await.map(|_| ()),
            EventBody::AppInstalled(job) => self.install(job).await,
            EventBody::AppUninstalled(job) => self.uninstall(job).await,
            EventBody::TokenRefreshRequested(job) => self.refresh_token(job).await.map(|_| ()),
        }
    }

    fn load(&self, id: Uuid) -> Result<Organisation, FunctionError> {
        self.store
            .get(id)
            .map_err(FunctionError::internal)?
            .ok_or_else(|| FunctionError::non_retriable(format!("unknown organisation {}", id)))
    }

    async fn publish(&self, event: PipelineEvent) -> Result<(), FunctionError> {
        self.publisher
            .publish(event)
            .await
            .map_err(FunctionError::internal)
    }

    /// Resolves the vendor credential for one run.
    ///
    /// A broker connection (from the event, else the organisation) wins when
    /// a broker is configured; stored credentials are used otherwise.
    async fn credentials(
        &self,
        organisation: &Organisation,
        connection_id: Option<&str>,
    ) -> Result<Credentials, CallFailure> {
        let connection_id = connection_id.or(organisation.nango_connection_id.as_deref());

        if let (Some(broker), Some(connection_id)) = (&self.broker, connection_id) {
            return Ok(broker.get_credentials(connection_id).await?);
        }

        organisation.credentials.clone().ok_or_else(|| CallFailure {
            kind: ErrorKind::Unauthorized,
            message: format!("organisation {} has no stored credentials", organisation.id),
            retry_after: None,
        })
    }

    /// Turns a call failure into the function's result.
    ///
    /// Auth-class failures mark the organisation `unauthorized`, report the
    /// status to elba, and are not retried.
    async fn fail(&self, organisation: &Organisation, failure: CallFailure) -> FunctionError {
        let Some(status) = failure.kind.connection_status() else {
            return failure.into();
        };

        warn!(
            organisation_id = %organisation.id,
            status = ?status,
            error = %failure.message,
            "Vendor rejected credentials, marking organisation unauthorized"
        );

        if let Err(e) = self
            .store
            .transition(organisation.id, LifecycleEvent::AuthFailed)
        {
            error!(organisation_id = %organisation.id, error = %e, "Failed to store auth failure");
        }

        if let Err(e) = self
            .elba
            .update_connection_status(organisation.id, &organisation.region, status, None)
            .await
        {
            error!(organisation_id = %organisation.id, error = %e, "Failed to report connection status");
        }

        FunctionError::NonRetriable(failure.message)
    }

    /// Marks an organisation unauthorized after its refresh attempts ran out.
    async fn refresh_exhausted(&self, organisation_id: Uuid, region: &str) {
        match self
            .store
            .transition(organisation_id, LifecycleEvent::AuthFailed)
        {
            Ok(Some(ConnectionState::Unauthorized)) | Ok(None) => {}
            Ok(Some(state)) => {
                warn!(organisation_id = %organisation_id, state = %state, "Unexpected state after auth failure")
            }
            Err(e) => {
                error!(organisation_id = %organisation_id, error = %e, "Failed to store auth failure")
            }
        }

        if let Err(e) = self
            .elba
            .update_connection_status(organisation_id, region, ConnectionStatus::Unauthorized, None)
            .await
        {
            error!(organisation_id = %organisation_id, error = %e, "Failed to report connection status");
        }

        info!(organisation_id = %organisation_id, "Token refresh gave up, organisation unauthorized");
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, event: &PipelineEvent) -> Result<(), FunctionError> {
        self.dispatch(event).await
    }

    async fn exhausted(&self, event: &PipelineEvent, _error: &FunctionError) {
        match &event.event {
            EventBody::TokenRefreshRequested(job) => {
                self.refresh_exhausted(job.organisation_id, &job.region).await
            }
            EventBody::SyncRequested(job) => self.sync_failed(job.organisation_id),
            _ => {}
        }
    }
}
