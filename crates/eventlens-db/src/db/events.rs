use eventlens_core::models::{BatchStatus, ItemError, UploadStatus};
use uuid::Uuid;

/// Change notification published by the batch store after a mutation commits.
///
/// Subscribers receive events in commit order. A lagging subscriber may miss
/// events and should re-read the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    BatchCreated {
        batch_id: Uuid,
        item_count: usize,
    },
    ItemUpdated {
        batch_id: Uuid,
        item_id: Uuid,
        item_status: UploadStatus,
        batch_status: BatchStatus,
        attempt_count: u32,
        error: Option<ItemError>,
    },
    /// Progress of an in-flight upload. Not persisted on its own.
    ItemProgress {
        batch_id: Uuid,
        item_id: Uuid,
        percent: u8,
    },
    BatchRemoved {
        batch_id: Uuid,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> Uuid {
        match self {
            BatchEvent::BatchCreated { batch_id, .. }
            | BatchEvent::ItemUpdated { batch_id, .. }
            | BatchEvent::ItemProgress { batch_id, .. }
            | BatchEvent::BatchRemoved { batch_id } => *batch_id,
        }
    }
}
