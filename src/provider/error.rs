//! # SM Errors
//!
//! Errors returned by Service Manager clients.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::time::Duration;
use thiserror::Error;

/// SM error type reported with 422 when another operation is running
pub const CONCURRENT_OPERATION_IN_PROGRESS: &str = "ConcurrentOperationInProgress";

#[derive(Debug, Error)]
pub enum SmError {
    /// SM answered with a non-success status
    #[error("Service Manager returned {status_code} ({error_type}): {description}")]
    Api {
        status_code: u16,
        error_type: String,
        description: String,
        retry_after: Option<DateTime<Utc>>,
    },

    /// The request never produced a response
    #[error("Service Manager request failed: {0}")]
    Transport(String),

    /// The response body could not be decoded
    #[error("failed to decode Service Manager response: {0}")]
    Decode(String),

    /// The client could not be configured from the resolved credentials
    #[error("invalid Service Manager client configuration: {0}")]
    Config(String),
}

impl SmError {
    pub fn api(status_code: u16, error_type: impl Into<String>, description: impl Into<String>) -> Self {
        SmError::Api {
            status_code,
            error_type: error_type.into(),
            description: description.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SmError::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_gone(&self) -> bool {
        self.status_code() == Some(410)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == Some(429)
    }

    pub fn is_concurrent_operation(&self) -> bool {
        matches!(
            self,
            SmError::Api { status_code: 422, error_type, .. } if error_type == CONCURRENT_OPERATION_IN_PROGRESS
        )
    }

    /// Errors worth retrying without user intervention
    pub fn is_transient(&self) -> bool {
        match self {
            SmError::Api { status_code, .. } => {
                matches!(status_code, 429 | 502 | 503 | 504) || self.is_concurrent_operation()
            }
            SmError::Transport(_) => true,
            SmError::Decode(_) | SmError::Config(_) => false,
        }
    }

    /// Delay requested by SM through `Retry-After`, measured from `now`
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            SmError::Api {
                retry_after: Some(at),
                ..
            } => (*at - now).to_std().ok(),
            _ => None,
        }
    }
}

/// Parse a `Retry-After` header value
///
/// SM sends `2006-01-02 15:04:05 -0700 MST`; RFC3339, RFC2822 and delta-seconds are accepted too.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<i64>() {
        // Out-of-range deltas fall back to the default backoff
        return TimeDelta::try_seconds(seconds.max(0)).and_then(|delta| now.checked_add_signed(delta));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts.with_timezone(&Utc));
    }
    // Drop the trailing zone abbreviation; the numeric offset is authoritative
    let without_zone = match value.rsplit_once(' ') {
        Some((head, tail)) if tail.chars().all(|c| c.is_ascii_alphabetic()) => head,
        _ => value,
    };
    if let Ok(ts) = DateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
