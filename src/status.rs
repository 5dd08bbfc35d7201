//! Data source status reported to the application.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// Data source is starting and has not received data yet.
    Initializing,
    /// Data source is receiving updates.
    Valid,
    /// Data source encountered an error and is trying to recover. Previously received data (if
    /// any) is still served.
    Interrupted,
    /// Data source has given up. This is terminal for a given data source instance.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// An error that does not fit other kinds, e.g., all data sources have been exhausted.
    Unknown,
    /// Transport-level failure (connection refused, reset, timeout).
    NetworkError,
    /// Server responded with a non-successful status code.
    ErrorResponse,
    /// Server sent data we could not understand.
    InvalidData,
    /// Data store failed to persist data.
    StoreError,
}

/// Description of the last error encountered by a data source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// HTTP status code, if the error came from an HTTP response.
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn from_status_code(status_code: u16) -> ErrorInfo {
        ErrorInfo {
            kind: ErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: format!("unexpected response status: {status_code}"),
            time: Utc::now(),
        }
    }

    /// Returns `true` if both values describe the same error, regardless of when it happened.
    pub fn is_same_as(&self, other: &ErrorInfo) -> bool {
        self.kind == other.kind
            && self.status_code == other.status_code
            && self.message == other.message
    }
}

impl From<&Error> for ErrorInfo {
    fn from(error: &Error) -> ErrorInfo {
        match error {
            Error::ErrorResponse { status } => ErrorInfo::from_status_code(*status),
            Error::Network(_) | Error::Io(_) => {
                ErrorInfo::new(ErrorKind::NetworkError, error.to_string())
            }
            Error::InvalidData(_) | Error::Protocol(_) => {
                ErrorInfo::new(ErrorKind::InvalidData, error.to_string())
            }
            Error::Store(_) => ErrorInfo::new(ErrorKind::StoreError, error.to_string()),
            _ => ErrorInfo::new(ErrorKind::Unknown, error.to_string()),
        }
    }
}

/// Returns `true` if the two optional errors describe the same error.
pub(crate) fn same_error(a: Option<&ErrorInfo>, b: Option<&ErrorInfo>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.is_same_as(b),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When `state` was entered.
    pub since: DateTime<Utc>,
    pub last_error: Option<ErrorInfo>,
}

impl DataSourceStatus {
    pub(crate) fn initializing() -> DataSourceStatus {
        DataSourceStatus {
            state: DataSourceState::Initializing,
            since: Utc::now(),
            last_error: None,
        }
    }
}

/// Returns `true` if a request that failed with `status` may succeed when retried.
///
/// Bad requests, timeouts, throttling and server errors are recoverable. Other client errors
/// (most importantly 401 and 403) are not.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}
