//! Error classification.
//!
//! Maps every [`DriverError`] onto one of three retry classes. Only
//! [`ErrorClassification::Transient`] failures are retried by managed
//! transactions.

use std::fmt;

use super::error::DriverError;

/// Server codes outside `Neo.TransientError` that still signal a
/// condition resolved by retrying (leader switch in a cluster).
const RETRYABLE_CLIENT_CODES: &[&str] = &[
    "Neo.ClientError.Cluster.NotALeader",
    "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase",
];

/// Transient codes that are caused by the client terminating its own work.
const NON_RETRYABLE_TRANSIENT_CODES: &[&str] = &[
    "Neo.TransientError.Transaction.Terminated",
    "Neo.TransientError.Transaction.LockClientStopped",
];

/// Retry class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Safe to retry in a fresh transaction.
    Transient,
    /// Caused by the request itself. Never retried.
    Client,
    /// Security or protocol breakdown. Never retried; the connection is dropped.
    Fatal,
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "TRANSIENT",
            Self::Client => "CLIENT",
            Self::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// Classify a driver error.
pub fn classify(err: &DriverError) -> ErrorClassification {
    match err {
        DriverError::Connection(_)
        | DriverError::Timeout(_)
        | DriverError::ServiceUnavailable(_) => ErrorClassification::Transient,
        DriverError::Authentication(_) | DriverError::Protocol(_) => ErrorClassification::Fatal,
        DriverError::Server { code, .. } => classify_code(code),
        _ => ErrorClassification::Client,
    }
}

/// Classify a server status code such as `Neo.TransientError.Transaction.DeadlockDetected`.
pub fn classify_code(code: &str) -> ErrorClassification {
    if NON_RETRYABLE_TRANSIENT_CODES.contains(&code) {
        return ErrorClassification::Client;
    }
    if code.starts_with("Neo.TransientError.") || RETRYABLE_CLIENT_CODES.contains(&code) {
        return ErrorClassification::Transient;
    }
    if code.starts_with("Neo.ClientError.Security.") || code.starts_with("Neo.ClientError.Request.") {
        return ErrorClassification::Fatal;
    }
    ErrorClassification::Client
}
