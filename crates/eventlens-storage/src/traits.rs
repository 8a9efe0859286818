//! Storage abstraction traits
//!
//! This module defines the persistence and upload primitives that every backend
//! must implement.

use async_trait::async_trait;
use eventlens_core::models::FileRef;
use eventlens_core::UploadFailure;
use thiserror::Error;
use tokio::sync::watch;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {required} bytes required, {limit} bytes allowed")]
    QuotaExceeded { required: u64, limit: u64 },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable key-value persistence.
///
/// `set` must not return before the value is durable: a value written by a
/// successful `set` is returned by `get` after a process restart.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    ///
    /// Fails with `QuotaExceeded` when the backend cannot hold the new value; the
    /// previous value is left intact.
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Channel an uploader reports progress on, in percent (0..=100).
pub type ProgressSender = watch::Sender<u8>;

/// Remote upload primitive.
///
/// Uploads one file to `destination` (a campaign id) and returns the URL of the
/// stored file.
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(
        &self,
        file_ref: &FileRef,
        destination: &str,
        progress: &ProgressSender,
    ) -> Result<String, UploadFailure>;
}
