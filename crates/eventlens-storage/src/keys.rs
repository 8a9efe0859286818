//! Shared key validation for storage backends.
//!
//! Destination format for uploads: `campaigns/{campaign_id}/{filename}`.

use crate::traits::{StorageError, StorageResult};

/// Reject keys that could escape the backend's root directory.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Generate the destination key for a file uploaded to a campaign.
pub fn generate_upload_key(campaign_id: &str, filename: &str) -> String {
    format!("campaigns/{}/{}", campaign_id, filename)
}
