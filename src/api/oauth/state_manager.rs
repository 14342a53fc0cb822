//! OAuth state management for CSRF protection.
//!
//! Each install attempt gets a single-use state token that remembers which
//! organisation and region started it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Pending install remembered between `/install` and `/oauth/callback`.
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub organisation_id: Uuid,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

/// OAuth state manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// `expiry_seconds` is how long a state stays valid (600 = 10 minutes).
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        // The map holds no invariants a panicking holder could break.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Generate a new state token (UUID v4) for an install attempt.
    pub fn create_state(&self, organisation_id: Uuid, region: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            organisation_id,
            region: region.to_string(),
            created_at: Utc::now(),
        };

        self.states().insert(state.clone(), entry);

        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the StateEntry if valid and not expired, None otherwise.
    /// The state is removed from the map (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let entry = self.states().remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Drop expired states
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let expiry = self.expiry_duration;
        self.states()
            .retain(|_, entry| now - entry.created_at <= expiry);
    }

    pub fn count(&self) -> usize {
        self.states().len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!("OAuth state cleanup complete, {} states remaining", manager.count());
    }
}
