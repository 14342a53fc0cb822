use elba_connect::error::ErrorKind;
use elba_connect::event::UserDeleteRequested;
use elba_connect::organisation::ConnectionState;
use tracing::info;

use super::{FunctionError, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The vendor no longer knows the user.
    AlreadyGone,
}

impl Pipeline {
    /// Deletes one user at the vendor. Running it twice is harmless.
    pub async fn delete_user(
        &self,
        job: &UserDeleteRequested,
    ) -> Result<DeleteOutcome, FunctionError> {
        let organisation = self.load(job.organisation_id)?;

        if organisation.state == ConnectionState::Unauthorized {
            return Err(FunctionError::non_retriable(format!(
                "organisation {} is unauthorized, cannot delete user {}",
                organisation.id, job.user_id
            )));
        }

        let credentials = match self
            .credentials(&organisation, job.nango_connection_id.as_deref())
            .await
        {
            Ok(credentials) => credentials,
            Err(failure) => return Err(self.fail(&organisation, failure).await),
        };

        let outcome = match self
            .vendor
            .delete_user(&credentials.access_token, &job.user_id)
            .await
        {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) if e.kind == ErrorKind::NotFound => DeleteOutcome::AlreadyGone,
            Err(e) => return Err(self.fail(&organisation, e.into()).await),
        };

        info!(
            organisation_id = %organisation.id,
            user_id = %job.user_id,
            outcome = ?outcome,
            "User delete handled"
        );

        Ok(outcome)
    }
}
