//! Classifications of single HTTP attempts and of whole protocol executions.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{Response, TransportError};

/// How a strategy classified one HTTP attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Success,
    SoldOut,
    Conflict,
    RateLimited,
    Timeout,
    Error,
}

/// The raw result of one HTTP call.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptOutcome {
    /// `None` when the request never produced a response.
    pub status: Option<u16>,
    pub latency: Duration,
    pub payload: Option<Value>,
    pub transport_error: Option<TransportError>,
}

impl AttemptOutcome {
    pub fn from_result(result: &Result<Response, TransportError>) -> Self {
        match result {
            Ok(response) => Self {
                status: Some(response.status),
                latency: response.latency,
                payload: response.payload(),
                transport_error: None,
            },
            Err(e) => Self {
                status: None,
                latency: Duration::ZERO,
                payload: None,
                transport_error: Some(e.clone()),
            },
        }
    }

    /// Maps the status through `by_status`, turning transport timeouts into
    /// [`Classification::Timeout`] and any other transport failure into an error.
    pub fn classify(&self, by_status: impl Fn(u16) -> Classification) -> Classification {
        match (self.status, &self.transport_error) {
            (Some(status), _) => by_status(status),
            (None, Some(e)) if e.is_timeout() => Classification::Timeout,
            (None, _) => Classification::Error,
        }
    }
}

/// Where a protocol execution ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolOutcome {
    /// A coupon was issued to this identity.
    Success,
    /// An asynchronous request was accepted but its result was not followed.
    Accepted,
    /// A probe completed without observing anything inconsistent.
    Probed,
    SoldOut,
    /// The service rejected a repeated request from the same identity.
    Duplicate,
    /// The service rejected the request as malformed.
    ClientError,
    /// The service gave up waiting for its lock.
    LockTimeout,
    /// The retry budget ran out on conflicts.
    Exhausted,
    /// Polling never reached a terminal result.
    Timeout,
    Error,
    Cancelled,
}

/// Coarse buckets used when reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    BusinessTerminal,
    Transient,
    ProtocolTimeout,
    SystemError,
    Cancelled,
}

impl ProtocolOutcome {
    pub const ALL: [ProtocolOutcome; 11] = [
        ProtocolOutcome::Success,
        ProtocolOutcome::Accepted,
        ProtocolOutcome::Probed,
        ProtocolOutcome::SoldOut,
        ProtocolOutcome::Duplicate,
        ProtocolOutcome::ClientError,
        ProtocolOutcome::LockTimeout,
        ProtocolOutcome::Exhausted,
        ProtocolOutcome::Timeout,
        ProtocolOutcome::Error,
        ProtocolOutcome::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolOutcome::Success => "success",
            ProtocolOutcome::Accepted => "accepted",
            ProtocolOutcome::Probed => "probed",
            ProtocolOutcome::SoldOut => "sold_out",
            ProtocolOutcome::Duplicate => "duplicate",
            ProtocolOutcome::ClientError => "client_error",
            ProtocolOutcome::LockTimeout => "lock_timeout",
            ProtocolOutcome::Exhausted => "exhausted",
            ProtocolOutcome::Timeout => "timeout",
            ProtocolOutcome::Error => "error",
            ProtocolOutcome::Cancelled => "cancelled",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolOutcome::Success | ProtocolOutcome::Accepted | ProtocolOutcome::Probed => {
                ErrorCategory::None
            }
            ProtocolOutcome::SoldOut
            | ProtocolOutcome::Duplicate
            | ProtocolOutcome::ClientError => ErrorCategory::BusinessTerminal,
            ProtocolOutcome::LockTimeout => ErrorCategory::Transient,
            ProtocolOutcome::Exhausted | ProtocolOutcome::Timeout => {
                ErrorCategory::ProtocolTimeout
            }
            ProtocolOutcome::Error => ErrorCategory::SystemError,
            ProtocolOutcome::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether the execution counts against the failure rate. Cancelled executions are
    /// excluded from both sides, so this returns `None` for them.
    pub fn is_failure(&self) -> Option<bool> {
        match self.category() {
            ErrorCategory::Cancelled => None,
            ErrorCategory::SystemError | ErrorCategory::ProtocolTimeout => Some(true),
            _ => Some(false),
        }
    }
}

impl fmt::Display for ProtocolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one `run_once` produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolResult {
    pub outcome: ProtocolOutcome,
    /// HTTP calls made against the issuing endpoint(s).
    pub attempts: u32,
    /// Result/status queries made while waiting.
    pub polls: u32,
    pub elapsed: Duration,
    pub detail: Option<String>,
}

impl ProtocolResult {
    pub fn new(outcome: ProtocolOutcome) -> Self {
        Self {
            outcome,
            attempts: 0,
            polls: 0,
            elapsed: Duration::ZERO,
            detail: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ProtocolOutcome::Cancelled)
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn polls(mut self, polls: u32) -> Self {
        self.polls = polls;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_timeouts_classify_as_timeout() {
        let outcome = AttemptOutcome::from_result(&Err(TransportError::Timeout(
            Duration::from_secs(1),
        )));
        assert_eq!(outcome.classify(|_| Classification::Success), Classification::Timeout);

        let outcome =
            AttemptOutcome::from_result(&Err(TransportError::Connect("refused".to_string())));
        assert_eq!(outcome.classify(|_| Classification::Success), Classification::Error);
    }

    #[test]
    fn cancelled_is_excluded_from_failure_rate() {
        assert_eq!(ProtocolOutcome::Cancelled.is_failure(), None);
        assert_eq!(ProtocolOutcome::SoldOut.is_failure(), Some(false));
        assert_eq!(ProtocolOutcome::Duplicate.is_failure(), Some(false));
        assert_eq!(ProtocolOutcome::Timeout.is_failure(), Some(true));
        assert_eq!(ProtocolOutcome::Error.is_failure(), Some(true));
    }
}
