//! Upload failure classification
//!
//! The upload primitive reports failures as [`UploadFailure`]. The pipeline only
//! needs to know whether a failure is recoverable (retried under the retry policy)
//! or terminal (left failed until the user retries explicitly).

use serde::{Deserialize, Serialize};

/// Failure reported by the remote upload primitive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadFailure {
    /// Connection dropped, DNS failure, timeout. Always recoverable.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote storage answered with an error.
    #[error("Server error (status {status:?}): {message}")]
    Server {
        status: Option<u16>,
        message: String,
    },

    /// Remote quota exhausted. Never retried automatically.
    #[error("Quota exceeded: {0}")]
    Quota(String),
}

/// Persisted shape of an [`UploadFailure`] kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Server,
    Quota,
}

impl UploadFailure {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn server(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: msg.into(),
        }
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Self::Quota(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            UploadFailure::Network(_) => FailureKind::Network,
            UploadFailure::Server { .. } => FailureKind::Server,
            UploadFailure::Quota(_) => FailureKind::Quota,
        }
    }

    /// Check if this failure may succeed on a later attempt.
    ///
    /// Server errors are transient unless they carry a terminal client-error status
    /// (4xx other than 408 Request Timeout and 429 Too Many Requests).
    pub fn is_recoverable(&self) -> bool {
        match self {
            UploadFailure::Network(_) => true,
            UploadFailure::Server { status, .. } => match status {
                Some(code) if (400..500).contains(code) => matches!(code, 408 | 429),
                _ => true,
            },
            UploadFailure::Quota(_) => false,
        }
    }
}
