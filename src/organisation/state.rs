//! Connection lifecycle of one organisation.
//!
//! ```text
//! uninstalled -> installed -> {syncing, idle} -> unauthorized -> removed
//! ```
//!
//! `removed` is terminal. A reinstall recovers an `unauthorized` connection.
//! A sync that fails for good returns the connection to `idle`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stored lifecycle state of an organisation's vendor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninstalled,
    Installed,
    Syncing,
    Idle,
    Unauthorized,
    Removed,
}

/// Something that happened to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Install,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    AuthFailed,
    Uninstall,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to a connection in state '{from}'")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: LifecycleEvent,
}

impl ConnectionState {
    /// Applies `event`, returning the next state.
    pub fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use ConnectionState::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Removed, Uninstall) => Some(Removed),
            (Removed, _) => None,
            (_, Uninstall) => Some(Removed),
            (_, AuthFailed) => Some(Unauthorized),
            (_, Install) => Some(Installed),
            // Follow-up pages and retries re-enter `syncing`.
            (Installed | Idle | Syncing, SyncStarted) => Some(Syncing),
            // Replaying the last page of a finished sync is harmless.
            (Syncing | Idle, SyncCompleted) => Some(Idle),
            (Syncing, SyncFailed) => Some(Idle),
            (state, SyncFailed) => Some(state),
            _ => None,
        };

        next.ok_or(TransitionError { from: self, event })
    }

    /// True when vendor calls should be attempted for this connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Installed | ConnectionState::Syncing | ConnectionState::Idle
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Uninstalled => "uninstalled",
            ConnectionState::Installed => "installed",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Idle => "idle",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uninstalled" => Some(ConnectionState::Uninstalled),
            "installed" => Some(ConnectionState::Installed),
            "syncing" => Some(ConnectionState::Syncing),
            "idle" => Some(ConnectionState::Idle),
            "unauthorized" => Some(ConnectionState::Unauthorized),
            "removed" => Some(ConnectionState::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
