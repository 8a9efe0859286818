//! Error types module
//!
//! This module provides the core error type used throughout the upload pipeline.
//! Store, orchestrator and bridge errors are unified under the `AppError` enum so the
//! surrounding UI can render them through [`ErrorMetadata`] without matching on
//! every variant.

use std::io;

use uuid::Uuid;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like an empty retry selection
    Debug,
    /// Warning level - for recoverable issues like a full local store
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata describing how an error should be presented to the user
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "STORAGE_QUOTA_EXCEEDED")
    fn error_code(&self) -> &'static str;

    /// Whether repeating the same call later may succeed
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the user
    fn suggested_action(&self) -> Option<&'static str>;

    /// User-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("No retry-eligible items in batch {batch_id}")]
    NoEligibleItems { batch_id: Uuid },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Storage(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON encoding error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (error_code, recoverable, suggested_action, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (&'static str, bool, Option<&'static str>, LogLevel) {
    match err {
        AppError::NotFound(_) => (
            "NOT_FOUND",
            false,
            Some("Verify the batch ID exists"),
            LogLevel::Debug,
        ),
        AppError::StorageQuotaExceeded(_) => (
            "STORAGE_QUOTA_EXCEEDED",
            false,
            Some("Clear completed upload history and try again"),
            LogLevel::Warn,
        ),
        AppError::NoEligibleItems { .. } => (
            "NO_ELIGIBLE_ITEMS",
            false,
            None,
            LogLevel::Debug,
        ),
        AppError::InvalidInput(_) => (
            "INVALID_INPUT",
            false,
            Some("Check the selected files and try again"),
            LogLevel::Debug,
        ),
        AppError::Storage(_) => (
            "STORAGE_ERROR",
            true,
            Some("Retry after a short delay"),
            LogLevel::Error,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get the error type name for detailed error output
    pub fn error_type(&self) -> &str {
        match self {
            AppError::NotFound(_) => "NotFound",
            AppError::StorageQuotaExceeded(_) => "StorageQuotaExceeded",
            AppError::NoEligibleItems { .. } => "NoEligibleItems",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::Storage(_) => "Storage",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// `NoEligibleItems` is reported as an error but is not a failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, AppError::NoEligibleItems { .. })
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for AppError {
    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).1
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).2
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).3
    }

    fn client_message(&self) -> String {
        match self {
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::StorageQuotaExceeded(_) => {
                "Not enough local storage to track this upload".to_string()
            }
            AppError::NoEligibleItems { .. } => "Nothing to retry".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::Storage(_) => "Failed to save upload progress".to_string(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_metadata_not_found() {
        let err = AppError::NotFound("Batch not found".to_string());
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert!(!err.is_recoverable());
        assert_eq!(err.client_message(), "Batch not found");
        assert_eq!(err.log_level(), LogLevel::Debug);
    }

    #[test]
    fn test_error_metadata_quota() {
        let err = AppError::StorageQuotaExceeded("4096 bytes limit".to_string());
        assert_eq!(err.error_code(), "STORAGE_QUOTA_EXCEEDED");
        assert!(!err.is_recoverable());
        assert_eq!(err.log_level(), LogLevel::Warn);
        assert_eq!(
            err.suggested_action(),
            Some("Clear completed upload history and try again")
        );
    }

    #[test]
    fn test_no_eligible_items_is_informational() {
        let err = AppError::NoEligibleItems {
            batch_id: Uuid::nil(),
        };
        assert!(err.is_informational());
        assert_eq!(err.error_code(), "NO_ELIGIBLE_ITEMS");
        assert!(!AppError::Storage("disk".into()).is_informational());
    }

    #[test]
    fn test_detailed_message_includes_source_chain() {
        let err: AppError = anyhow::anyhow!("disk unplugged")
            .context("failed to persist batches")
            .into();
        let details = err.detailed_message();
        assert!(details.contains("Internal error with source"));
        assert!(details.contains("failed to persist batches"));
    }
}
