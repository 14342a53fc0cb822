//! Error taxonomy shared by every outbound call of the pipeline.
//!
//! Vendor, elba and broker responses are classified into an [`ErrorKind`]
//! from their status code and headers. Functions decide retry behaviour from
//! the kind alone.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

use crate::elba::ConnectionStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, timeout, 502/503/504.
    TransientNetwork,
    /// 429, or a 403 that reports an exhausted rate limit.
    RateLimited,
    /// 401: the credential is no longer valid.
    Unauthorized,
    /// 403: the credential lacks admin rights.
    NotAdmin,
    /// 404: tolerated as success by deletes.
    NotFound,
    /// 400/422, or a response body that does not parse.
    MalformedPayload,
    Internal,
}

impl ErrorKind {
    /// Classifies a non-success response. Returns `None` for 2xx/3xx.
    pub fn from_response(status: StatusCode, headers: &HeaderMap) -> Option<Self> {
        if !status.is_client_error() && !status.is_server_error() {
            return None;
        }

        let kind = match status {
            StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
            StatusCode::FORBIDDEN if rate_limit_exhausted(headers) => ErrorKind::RateLimited,
            StatusCode::FORBIDDEN => ErrorKind::NotAdmin,
            StatusCode::NOT_FOUND => ErrorKind::NotFound,
            StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ErrorKind::MalformedPayload
            }
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => ErrorKind::TransientNetwork,
            _ => ErrorKind::Internal,
        };
        Some(kind)
    }

    /// Classifies a transport-level failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            ErrorKind::MalformedPayload
        } else if err.is_builder() {
            ErrorKind::Internal
        } else {
            ErrorKind::TransientNetwork
        }
    }

    /// Transient, rate-limited and internal failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::RateLimited | ErrorKind::Internal
        )
    }

    /// The status reported to elba when this error invalidates the connection.
    pub fn connection_status(self) -> Option<ConnectionStatus> {
        match self {
            ErrorKind::Unauthorized => Some(ConnectionStatus::Unauthorized),
            ErrorKind::NotAdmin => Some(ConnectionStatus::NotAdmin),
            _ => None,
        }
    }
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(0)
}

/// Server-requested delay before the next attempt.
///
/// Reads `Retry-After` (delta seconds or HTTP date) first, then
/// `x-ratelimit-reset` (epoch seconds, or delta seconds for small values).
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(value) = headers.get("retry-after").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(value) {
            return Some(until(at.with_timezone(&Utc), now));
        }
    }

    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;

    // Anything before 2001 is a delta, not an epoch.
    if reset < 1_000_000_000 {
        return Some(Duration::from_secs(reset.max(0) as u64));
    }
    let at = DateTime::<Utc>::from_timestamp(reset, 0)?;
    Some(until(at, now))
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}
