//! Error taxonomy for the acquisition pipeline
//!
//! Adapters and the content store return [`DownloadError`]. The state machine
//! catches every one of them at its boundary and turns it into a
//! [`FailureInfo`] attached to the `failed` stage; they never escape a
//! download run.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Pipeline result type
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors raised by source adapters, the content store and the manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    /// Upstream id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials are missing or expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Network failure or rate limit
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Content stream ended before it was complete
    #[error("Incomplete download: {0}")]
    Incomplete(String),

    /// Local disk failure
    #[error("IO error: {0}")]
    Io(String),

    /// Malformed request, e.g. an unsupported kind for a service
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Stable, wire-level name of an error variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Transient,
    Incomplete,
    Io,
    InvalidArgument,
}

impl DownloadError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::Incomplete(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// The variant, without its message
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Incomplete(_) => ErrorKind::Incomplete,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Whether a fresh request for the same item may succeed.
    ///
    /// An early-terminated stream is treated like any other transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Incomplete(_))
    }

    /// Map an unsuccessful HTTP status to an error
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Self::NotFound(format!("{} (status {})", context, status))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Unauthorized(format!("{} (status {})", context, status))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::InvalidArgument(format!("{} (status {})", context, status))
            }
            _ => Self::Transient(format!("{} (status {})", context, status)),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::from_status(status, "Request failed"),
            None => Self::Transient(e.to_string()),
        }
    }
}

/// A preserved failure, as shown to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Advisory only: no retry counter is kept
    pub retryable: bool,
}

impl From<&DownloadError> for FailureInfo {
    fn from(e: &DownloadError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<DownloadError> for FailureInfo {
    fn from(e: DownloadError) -> Self {
        Self::from(&e)
    }
}
