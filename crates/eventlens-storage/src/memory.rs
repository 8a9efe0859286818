use crate::keys::validate_key;
use crate::traits::{KeyValueStore, StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory key-value store
///
/// Clones share the same map, so a clone handed to a second store instance sees
/// everything the first one persisted. Used to simulate reloads in tests.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    quota_bytes: Option<u64>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total size of all stored values.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Arc::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes currently stored
    pub async fn used_bytes(&self) -> u64 {
        let entries = self.entries.lock().await;
        entries.values().map(|v| v.len() as u64).sum()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let mut entries = self.entries.lock().await;

        if let Some(limit) = self.quota_bytes {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            let required = others + value.len() as u64;
            if required > limit {
                tracing::debug!(key = %key, required, limit, "Memory store quota exceeded");
                return Err(StorageError::QuotaExceeded { required, limit });
            }
        }

        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
