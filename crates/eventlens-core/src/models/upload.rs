use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::upload_error::{FailureKind, UploadFailure};

/// Opaque handle to the binary payload of an upload (a path for local sources).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the handle, used as the destination file name.
    pub fn file_name(&self) -> &str {
        self.0
            .rsplit(['/', '\\'])
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.0)
    }
}

impl Display for FileRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadStatus::Pending => write!(f, "pending"),
            UploadStatus::Uploading => write!(f, "uploading"),
            UploadStatus::Completed => write!(f, "completed"),
            UploadStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid upload status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    PartiallyFailed,
}

impl BatchStatus {
    /// Batches the retry sweep looks at.
    pub fn needs_retry(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::PartiallyFailed)
    }

    /// No item is pending or uploading.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::PartiallyFailed
        )
    }
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Uploading => write!(f, "uploading"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::PartiallyFailed => write!(f, "partially_failed"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "uploading" => Ok(BatchStatus::Uploading),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "partially_failed" => Ok(BatchStatus::PartiallyFailed),
            _ => Err(anyhow::anyhow!("Invalid batch status: {}", s)),
        }
    }
}

/// Derive a batch status from the statuses of its items.
///
/// `completed` iff all completed, `failed` iff all failed, `partially_failed` for a
/// completed/failed mix with nothing in flight. Otherwise `uploading` if any item is
/// uploading, else `pending`.
pub fn derive_batch_status<I>(statuses: I) -> BatchStatus
where
    I: IntoIterator<Item = UploadStatus>,
{
    let (mut pending, mut uploading, mut completed, mut failed) = (0usize, 0usize, 0usize, 0usize);
    for status in statuses {
        match status {
            UploadStatus::Pending => pending += 1,
            UploadStatus::Uploading => uploading += 1,
            UploadStatus::Completed => completed += 1,
            UploadStatus::Failed => failed += 1,
        }
    }

    if pending + uploading + completed + failed == 0 {
        return BatchStatus::Pending;
    }
    if uploading > 0 {
        return BatchStatus::Uploading;
    }
    if pending > 0 {
        return BatchStatus::Pending;
    }
    match (completed, failed) {
        (_, 0) => BatchStatus::Completed,
        (0, _) => BatchStatus::Failed,
        _ => BatchStatus::PartiallyFailed,
    }
}

/// Last error recorded on an item, persisted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: FailureKind,
    pub message: String,
    pub recoverable: bool,
}

impl From<&UploadFailure> for ItemError {
    fn from(failure: &UploadFailure) -> Self {
        Self {
            kind: failure.kind(),
            message: failure.to_string(),
            recoverable: failure.is_recoverable(),
        }
    }
}

/// A file the user asked to upload, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUploadItem {
    pub file_ref: FileRef,
    pub target_campaign_id: String,
}

impl NewUploadItem {
    pub fn new(file_ref: impl Into<String>, target_campaign_id: impl Into<String>) -> Self {
        Self {
            file_ref: FileRef::new(file_ref),
            target_campaign_id: target_campaign_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: Uuid,
    pub file_ref: FileRef,
    pub target_campaign_id: String,
    pub status: UploadStatus,
    pub progress_percent: u8,
    pub last_error: Option<ItemError>,
    pub attempt_count: u32,
    #[serde(default)]
    pub uploaded_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UploadItem {
    pub fn new(new_item: NewUploadItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_ref: new_item.file_ref,
            target_campaign_id: new_item.target_campaign_id,
            status: UploadStatus::Pending,
            progress_percent: 0,
            last_error: None,
            attempt_count: 0,
            uploaded_url: None,
            updated_at: Utc::now(),
        }
    }

    /// Failed with an error that a later attempt could fix.
    pub fn failed_recoverably(&self) -> bool {
        self.status == UploadStatus::Failed
            && self.last_error.as_ref().map_or(true, |e| e.recoverable)
    }

    /// Failed, recoverable and still under the attempt ceiling.
    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        self.failed_recoverably() && self.attempt_count < max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub items: Vec<UploadItem>,
    status: BatchStatus,
}

impl UploadBatch {
    pub fn new(items: Vec<NewUploadItem>) -> Self {
        let mut batch = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            items: items.into_iter().map(UploadItem::new).collect(),
            status: BatchStatus::Pending,
        };
        batch.recompute_status();
        batch
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Re-derive the batch status from the current item statuses.
    pub fn recompute_status(&mut self) -> BatchStatus {
        self.status = derive_batch_status(self.items.iter().map(|item| item.status));
        self.status
    }

    pub fn item(&self, item_id: Uuid) -> Option<&UploadItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut UploadItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn count_with_status(&self, status: UploadStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    /// Failed items the user still has to act on, in submission order.
    pub fn items_needing_attention(&self) -> Vec<&UploadItem> {
        self.items
            .iter()
            .filter(|item| item.status == UploadStatus::Failed)
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.status == UploadStatus::Pending)
    }
}

/// An item moved to `uploading` by the dispatcher.
///
/// `attempt` is the item's attempt count at claim time and acts as the generation
/// used to discard results of superseded attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    pub batch_id: Uuid,
    pub item_id: Uuid,
    pub file_ref: FileRef,
    pub target_campaign_id: String,
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = UploadStatus> {
        prop_oneof![
            Just(UploadStatus::Pending),
            Just(UploadStatus::Uploading),
            Just(UploadStatus::Completed),
            Just(UploadStatus::Failed),
        ]
    }

    #[test]
    fn test_derive_batch_status_cases() {
        use UploadStatus::*;
        assert_eq!(derive_batch_status([Completed, Completed]), BatchStatus::Completed);
        assert_eq!(derive_batch_status([Failed, Failed]), BatchStatus::Failed);
        assert_eq!(
            derive_batch_status([Completed, Failed, Completed]),
            BatchStatus::PartiallyFailed
        );
        assert_eq!(derive_batch_status([Pending, Uploading]), BatchStatus::Uploading);
        assert_eq!(derive_batch_status([Pending, Completed]), BatchStatus::Pending);
        assert_eq!(derive_batch_status([Failed, Pending]), BatchStatus::Pending);
        assert_eq!(derive_batch_status([Uploading, Failed]), BatchStatus::Uploading);
    }

    #[test]
    fn test_file_ref_file_name() {
        assert_eq!(FileRef::new("/photos/event/a.jpg").file_name(), "a.jpg");
        assert_eq!(FileRef::new("C:\\photos\\b.png").file_name(), "b.png");
        assert_eq!(FileRef::new("plain.jpg").file_name(), "plain.jpg");
    }

    #[test]
    fn test_retry_eligibility() {
        let mut item = UploadItem::new(NewUploadItem::new("a.jpg", "camp"));
        assert!(!item.is_retry_eligible(5));

        item.status = UploadStatus::Failed;
        item.attempt_count = 2;
        item.last_error = Some(ItemError::from(&UploadFailure::network("reset")));
        assert!(item.is_retry_eligible(5));
        assert!(!item.is_retry_eligible(2));

        item.last_error = Some(ItemError::from(&UploadFailure::quota("full")));
        assert!(!item.is_retry_eligible(5));
    }

    #[test]
    fn test_batch_status_round_trips_through_display() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Uploading,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::PartiallyFailed,
        ] {
            assert_eq!(status.to_string().parse::<BatchStatus>().unwrap(), status);
        }
    }

    mod proptest_tests {
        use super::*;

        proptest! {
            /// Property: the batch status is exactly the documented function of item statuses.
            #[test]
            fn batch_status_is_function_of_items(
                statuses in proptest::collection::vec(status_strategy(), 1..12)
            ) {
                let count = |s: UploadStatus| statuses.iter().filter(|x| **x == s).count();
                let total = statuses.len();
                let (pending, uploading, completed, failed) = (
                    count(UploadStatus::Pending),
                    count(UploadStatus::Uploading),
                    count(UploadStatus::Completed),
                    count(UploadStatus::Failed),
                );

                let derived = derive_batch_status(statuses.iter().copied());

                prop_assert_eq!(derived == BatchStatus::Completed, completed == total);
                prop_assert_eq!(derived == BatchStatus::Failed, failed == total);
                prop_assert_eq!(
                    derived == BatchStatus::PartiallyFailed,
                    pending == 0 && uploading == 0 && completed > 0 && failed > 0
                );
                if uploading > 0 {
                    prop_assert_eq!(derived, BatchStatus::Uploading);
                } else if pending > 0 {
                    prop_assert_eq!(derived, BatchStatus::Pending);
                }
            }

            /// Property: a batch built from items always carries the derived status.
            #[test]
            fn batch_recompute_matches_derivation(
                statuses in proptest::collection::vec(status_strategy(), 1..8)
            ) {
                let mut batch = UploadBatch::new(
                    statuses.iter().map(|_| NewUploadItem::new("x.jpg", "camp")).collect(),
                );
                for (item, status) in batch.items.iter_mut().zip(&statuses) {
                    item.status = *status;
                }
                let recomputed = batch.recompute_status();
                prop_assert_eq!(recomputed, derive_batch_status(statuses.iter().copied()));
                prop_assert_eq!(batch.status(), recomputed);
            }
        }
    }
}
