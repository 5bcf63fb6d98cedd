//! Error taxonomy. Everything that reaches a `WaterfallListener` is a `MediationError`
//! with a stable `ErrorReason`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Stable reason code handed to callers and to the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    NoConnection,
    NetworkTimeout,
    ServerError,
    Unspecified,
    BadBody,
    BadHeaderData,
    WarmingUp,
    NoFill,
    TooManyRequests,
    /// Caller-reported: no adapter could render the candidate.
    AdapterNotFound,
    /// Caller-reported: the candidate's creative could not be used.
    InvalidData,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::NoConnection => "no_connection",
            ErrorReason::NetworkTimeout => "network_timeout",
            ErrorReason::ServerError => "server_error",
            ErrorReason::Unspecified => "unspecified",
            ErrorReason::BadBody => "bad_body",
            ErrorReason::BadHeaderData => "bad_header_data",
            ErrorReason::WarmingUp => "warming_up",
            ErrorReason::NoFill => "no_fill",
            ErrorReason::TooManyRequests => "too_many_requests",
            ErrorReason::AdapterNotFound => "adapter_not_found",
            ErrorReason::InvalidData => "invalid_data",
        }
    }

    /// Numeric code for hosts that only see integers (see `ffi`).
    pub fn code(self) -> i32 {
        match self {
            ErrorReason::NoConnection => 1,
            ErrorReason::NetworkTimeout => 2,
            ErrorReason::ServerError => 3,
            ErrorReason::Unspecified => 4,
            ErrorReason::BadBody => 5,
            ErrorReason::BadHeaderData => 6,
            ErrorReason::WarmingUp => 7,
            ErrorReason::NoFill => 8,
            ErrorReason::TooManyRequests => 9,
            ErrorReason::AdapterNotFound => 10,
            ErrorReason::InvalidData => 11,
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure decoding one exchange response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed response body: {0}")]
    BadBody(String),
    #[error("malformed response metadata: {0}")]
    BadHeaderData(String),
    #[error("no fill (retry in {}ms)", .refresh.as_millis())]
    NoFill { refresh: Duration },
    #[error("ad unit warming up (retry in {}ms)", .refresh.as_millis())]
    WarmingUp { refresh: Duration },
}

impl ParseError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            ParseError::BadBody(_) => ErrorReason::BadBody,
            ParseError::BadHeaderData(_) => ErrorReason::BadHeaderData,
            ParseError::NoFill { .. } => ErrorReason::NoFill,
            ParseError::WarmingUp { .. } => ErrorReason::WarmingUp,
        }
    }
}

/// Terminal error delivered to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediationError {
    #[error("transport failure ({reason}): {message}")]
    Transport {
        reason: ErrorReason,
        message: String,
    },
    #[error("malformed response body: {0}")]
    BadBody(String),
    #[error("malformed response metadata: {0}")]
    BadHeaderData(String),
    #[error("ad unit warming up (retry in {}ms)", .refresh.as_millis())]
    WarmingUp { refresh: Duration },
    #[error("no fill (retry in {}ms)", .refresh.as_millis())]
    NoFill { refresh: Duration },
    #[error("too many requests: {}", .reason.as_deref().unwrap_or("rate limited"))]
    TooManyRequests {
        reason: Option<String>,
        retry_after: Duration,
    },
}

impl MediationError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            MediationError::Transport { reason, .. } => *reason,
            MediationError::BadBody(_) => ErrorReason::BadBody,
            MediationError::BadHeaderData(_) => ErrorReason::BadHeaderData,
            MediationError::WarmingUp { .. } => ErrorReason::WarmingUp,
            MediationError::NoFill { .. } => ErrorReason::NoFill,
            MediationError::TooManyRequests { .. } => ErrorReason::TooManyRequests,
        }
    }

    /// How long the caller should wait before building a new waterfall, when the server said.
    pub fn refresh_hint(&self) -> Option<Duration> {
        match self {
            MediationError::WarmingUp { refresh } | MediationError::NoFill { refresh } => {
                Some(*refresh)
            }
            MediationError::TooManyRequests { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<ParseError> for MediationError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::BadBody(m) => MediationError::BadBody(m),
            ParseError::BadHeaderData(m) => MediationError::BadHeaderData(m),
            ParseError::NoFill { refresh } => MediationError::NoFill { refresh },
            ParseError::WarmingUp { refresh } => MediationError::WarmingUp { refresh },
        }
    }
}

impl From<TransportError> for MediationError {
    fn from(e: TransportError) -> Self {
        // NoConnection gets its own code; it does not share the generic branch.
        let reason = match &e {
            TransportError::NoConnection(_) => ErrorReason::NoConnection,
            TransportError::Timeout => ErrorReason::NetworkTimeout,
            TransportError::Status(code) if *code >= 400 => ErrorReason::ServerError,
            TransportError::Status(_) | TransportError::Cancelled | TransportError::Other(_) => {
                ErrorReason::Unspecified
            }
        };
        MediationError::Transport {
            reason,
            message: e.to_string(),
        }
    }
}
