use std::sync::Arc;

use crate::data_store::StoreError;

/// Represents a result type for operations in this crate.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while acquiring data.
///
/// Most of these errors never escape public orchestration operations. They are converted into
/// [`ErrorInfo`](crate::ErrorInfo) and reported as a status transition instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// An operation was called in a state where it is not allowed. This is a programming error in
    /// the caller.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Server sent a payload we could not parse.
    #[error("invalid data received from the server")]
    InvalidData(#[source] Arc<serde_json::Error>),

    /// Server sent well-formed data that does not follow the protocol (e.g., a polling response
    /// without a server intent).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server responded with a non-successful status code.
    #[error("unexpected response status: {status}")]
    ErrorResponse {
        /// HTTP status code.
        status: u16,
    },

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Data store failed to persist or read data.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidData(Arc::new(value))
    }
}
