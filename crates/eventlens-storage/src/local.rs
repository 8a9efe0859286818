use crate::keys::{generate_upload_key, validate_key};
use crate::traits::{FileUploader, KeyValueStore, ProgressSender, StorageError, StorageResult};
use async_trait::async_trait;
use eventlens_core::models::FileRef;
use eventlens_core::UploadFailure;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Local filesystem key-value store
///
/// Each key is stored as `{base_path}/{key}.json`. Writes go to a temporary file
/// that is synced and then renamed over the target, so a crash mid-write leaves
/// the previous value readable.
#[derive(Clone)]
pub struct LocalKvStore {
    base_path: PathBuf,
    quota_bytes: Option<u64>,
}

impl LocalKvStore {
    /// Create a new LocalKvStore rooted at `base_path` (e.g. "~/.eventlens/state")
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create state directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalKvStore {
            base_path,
            quota_bytes: None,
        })
    }

    /// Limit the total size of all stored values.
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        if key.contains('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(
                "Key-value keys must not contain path separators".to_string(),
            ));
        }
        Ok(self.base_path.join(format!("{}.json", key)))
    }

    /// Bytes used by every stored value except `exclude`.
    async fn used_bytes_excluding(&self, exclude: &Path) -> StorageResult<u64> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == exclude || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }
}

#[async_trait]
impl KeyValueStore for LocalKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.key_to_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let path = self.key_to_path(key)?;

        if let Some(limit) = self.quota_bytes {
            let required = self.used_bytes_excluding(&path).await? + value.len() as u64;
            if required > limit {
                return Err(StorageError::QuotaExceeded { required, limit });
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let start = std::time::Instant::now();

        let mut file = fs::File::create(&tmp_path).await.map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to create file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        file.write_all(&value).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to write file {}: {}", tmp_path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to sync file {}: {}", tmp_path.display(), e))
        })?;
        drop(file);

        fs::rename(&tmp_path, &path).await.map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to replace {} with {}: {}",
                path.display(),
                tmp_path.display(),
                e
            ))
        })?;

        tracing::trace!(
            path = %path.display(),
            size_bytes = value.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local state write committed"
        );

        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Upload primitive that copies files into a local destination tree
///
/// Files land at `{base_path}/campaigns/{campaign_id}/{filename}` and are served
/// from `{base_url}/campaigns/{campaign_id}/{filename}`.
#[derive(Clone)]
pub struct LocalUploader {
    base_path: PathBuf,
    base_url: String,
    max_file_bytes: Option<u64>,
}

impl LocalUploader {
    /// Create a new LocalUploader
    ///
    /// # Arguments
    /// * `base_path` - Root directory for uploaded files
    /// * `base_url` - Base URL for serving files (e.g., "file:///var/lib/eventlens")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create upload directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalUploader {
            base_path,
            base_url,
            max_file_bytes: None,
        })
    }

    /// Reject files larger than `max_file_bytes` with a quota failure.
    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = Some(max_file_bytes);
        self
    }

    fn generate_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    async fn copy_with_progress(
        &self,
        source: &Path,
        target: &Path,
        total: u64,
        progress: &ProgressSender,
    ) -> std::io::Result<()> {
        let mut reader = fs::File::open(source).await?;
        let mut writer = fs::File::create(target).await?;
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        let mut copied: u64 = 0;

        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await?;
            copied += read as u64;
            if total > 0 {
                let percent = ((copied * 100) / total).min(100) as u8;
                progress.send_replace(percent);
            }
        }

        writer.sync_all().await?;
        Ok(())
    }
}

fn io_failure(context: &str, e: std::io::Error) -> UploadFailure {
    match e.kind() {
        ErrorKind::NotFound => UploadFailure::server(Some(404), format!("{}: {}", context, e)),
        ErrorKind::PermissionDenied => {
            UploadFailure::server(Some(403), format!("{}: {}", context, e))
        }
        _ => UploadFailure::network(format!("{}: {}", context, e)),
    }
}

#[async_trait]
impl FileUploader for LocalUploader {
    async fn upload(
        &self,
        file_ref: &FileRef,
        destination: &str,
        progress: &ProgressSender,
    ) -> Result<String, UploadFailure> {
        let key = generate_upload_key(destination, file_ref.file_name());
        validate_key(&key).map_err(|e| UploadFailure::server(Some(400), e.to_string()))?;

        let source = PathBuf::from(file_ref.as_str());
        let size = fs::metadata(&source)
            .await
            .map_err(|e| io_failure("Failed to stat source file", e))?
            .len();

        if let Some(limit) = self.max_file_bytes {
            if size > limit {
                return Err(UploadFailure::quota(format!(
                    "{} is {} bytes, limit is {} bytes",
                    file_ref, size, limit
                )));
            }
        }

        let target = self.base_path.join(&key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("Failed to create destination directory", e))?;
        }

        let start = std::time::Instant::now();
        self.copy_with_progress(&source, &target, size, progress)
            .await
            .map_err(|e| io_failure("Failed to copy file", e))?;
        progress.send_replace(100);

        let url = self.generate_url(&key);

        tracing::info!(
            path = %target.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local upload successful"
        );

        Ok(url)
    }
}
