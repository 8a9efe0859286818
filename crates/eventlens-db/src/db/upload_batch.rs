use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use eventlens_core::models::{
    BatchStatus, ClaimedItem, ItemError, NewUploadItem, UploadBatch, UploadItem, UploadStatus,
};
use eventlens_core::{AppError, AppResult, UploadFailure};
use eventlens_storage::KeyValueStore;

use super::events::BatchEvent;

/// Key under which the batch record is persisted.
pub const BATCHES_STORAGE_KEY: &str = "upload_batches";

/// Key the last unreadable record is copied to before the store starts empty.
const CORRUPT_BACKUP_KEY: &str = "upload_batches_corrupt";

const RECORD_VERSION: u32 = 1;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Serialize)]
struct PersistedBatchesRef<'a> {
    version: u32,
    batches: &'a [UploadBatch],
}

#[derive(Deserialize)]
struct PersistedBatches {
    version: u32,
    batches: Vec<UploadBatch>,
}

/// Which failed items [`UploadBatchStore::requeue_failed`] moves back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueScope {
    /// Failed items with a recoverable error and `attempt_count < max_attempts`.
    Eligible { max_attempts: u32 },
    /// Every failed item; attempt counts and errors are reset.
    All,
}

impl RequeueScope {
    fn selects(&self, item: &UploadItem) -> bool {
        match self {
            RequeueScope::Eligible { max_attempts } => item.is_retry_eligible(*max_attempts),
            RequeueScope::All => item.status == UploadStatus::Failed,
        }
    }
}

struct StoreInner {
    kv: Arc<dyn KeyValueStore>,
    /// Committed state, newest batch first. The lock serializes all mutations.
    state: Mutex<Vec<UploadBatch>>,
    snapshot: watch::Sender<Arc<Vec<UploadBatch>>>,
    events: broadcast::Sender<BatchEvent>,
}

/// Durable registry of upload batches and their items.
///
/// Every mutation is applied to a copy of the committed state, persisted, and only
/// then committed and published, so a failed write leaves nothing behind. Reads are
/// served from the last committed snapshot and never wait on writers.
#[derive(Clone)]
pub struct UploadBatchStore {
    inner: Arc<StoreInner>,
}

impl UploadBatchStore {
    /// Load the store from `kv`.
    ///
    /// A missing record yields an empty store. An unreadable or undecodable record is
    /// logged, copied to a backup key when possible, and also yields an empty store.
    /// Items persisted mid-upload are restored as `pending`.
    #[tracing::instrument(skip(kv))]
    pub async fn open(kv: Arc<dyn KeyValueStore>) -> Self {
        let batches = match kv.get(BATCHES_STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_slice::<PersistedBatches>(&raw) {
                Ok(record) => {
                    if record.version != RECORD_VERSION {
                        tracing::warn!(
                            version = record.version,
                            expected = RECORD_VERSION,
                            "Persisted batch record has unexpected version, loading anyway"
                        );
                    }
                    Self::restore(record.batches)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        size_bytes = raw.len(),
                        "Persisted batch record is corrupt, starting with an empty store"
                    );
                    if let Err(backup_err) = kv.set(CORRUPT_BACKUP_KEY, raw).await {
                        tracing::warn!(error = %backup_err, "Failed to back up corrupt batch record");
                    }
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to read persisted batch record, starting with an empty store"
                );
                Vec::new()
            }
        };

        tracing::info!(batch_count = batches.len(), "Upload batch store opened");

        let (snapshot, _) = watch::channel(Arc::new(batches.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                kv,
                state: Mutex::new(batches),
                snapshot,
                events,
            }),
        }
    }

    fn restore(mut batches: Vec<UploadBatch>) -> Vec<UploadBatch> {
        for batch in &mut batches {
            for item in &mut batch.items {
                if item.status == UploadStatus::Uploading {
                    tracing::info!(
                        batch_id = %batch.id,
                        item_id = %item.id,
                        attempt_count = item.attempt_count,
                        "Restoring interrupted upload as pending"
                    );
                    item.status = UploadStatus::Pending;
                    item.progress_percent = 0;
                }
            }
            batch.recompute_status();
        }
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the committed batch list; changes whenever a mutation commits.
    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<Vec<UploadBatch>>> {
        self.inner.snapshot.subscribe()
    }

    /// Last committed batch list, newest first.
    pub fn snapshot(&self) -> Arc<Vec<UploadBatch>> {
        self.inner.snapshot.borrow().clone()
    }

    /// All batches, most recent first.
    pub fn get_all_batches(&self) -> Vec<UploadBatch> {
        self.snapshot().as_ref().clone()
    }

    pub fn get_batch(&self, batch_id: Uuid) -> AppResult<UploadBatch> {
        self.snapshot()
            .iter()
            .find(|batch| batch.id == batch_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Upload batch {} not found", batch_id)))
    }

    /// Ids of batches in `failed` or `partially_failed` state.
    pub fn batches_needing_retry(&self) -> Vec<Uuid> {
        self.snapshot()
            .iter()
            .filter(|batch| batch.status().needs_retry())
            .map(|batch| batch.id)
            .collect()
    }

    /// Ids of batches with at least one pending item.
    pub fn batches_with_pending(&self) -> Vec<Uuid> {
        self.snapshot()
            .iter()
            .filter(|batch| batch.has_pending())
            .map(|batch| batch.id)
            .collect()
    }

    /// Create a batch with every item pending. Nothing is kept if persisting fails.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn create_batch(&self, items: Vec<NewUploadItem>) -> AppResult<Uuid> {
        if items.is_empty() {
            return Err(AppError::InvalidInput(
                "An upload batch needs at least one file".to_string(),
            ));
        }

        let batch = UploadBatch::new(items);
        let batch_id = batch.id;
        let item_count = batch.items.len();

        self.mutate(move |batches| {
            batches.insert(0, batch);
            Ok((
                (),
                vec![BatchEvent::BatchCreated {
                    batch_id,
                    item_count,
                }],
            ))
        })
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, batch_id = %batch_id, "Failed to create upload batch");
        })?;

        tracing::info!(batch_id = %batch_id, item_count, "Upload batch created");
        Ok(batch_id)
    }

    /// Set the status of one item and recompute the batch status.
    ///
    /// `error` is recorded on `failed`; `completed` clears the last error.
    #[tracing::instrument(skip(self, error))]
    pub async fn update_item_status(
        &self,
        batch_id: Uuid,
        item_id: Uuid,
        status: UploadStatus,
        error: Option<ItemError>,
    ) -> AppResult<BatchStatus> {
        self.mutate(move |batches| {
            let batch = find_batch_mut(batches, batch_id)?;
            let item = find_item_mut(batch, item_id)?;

            item.status = status;
            item.updated_at = Utc::now();
            match status {
                UploadStatus::Pending => item.progress_percent = 0,
                UploadStatus::Uploading => {}
                UploadStatus::Completed => {
                    item.progress_percent = 100;
                    item.last_error = None;
                }
                UploadStatus::Failed => {
                    if error.is_some() {
                        item.last_error = error;
                    }
                }
            }

            let event = item_event(batch_id, item);
            let batch_status = batch.recompute_status();
            Ok((batch_status, vec![with_batch_status(event, batch_status)]))
        })
        .await
    }

    /// Record upload progress for an in-flight attempt.
    ///
    /// Ignored unless the item is still uploading under `attempt`. Progress is held
    /// in memory and written with the next persisted mutation.
    pub async fn update_item_progress(
        &self,
        batch_id: Uuid,
        item_id: Uuid,
        attempt: u32,
        percent: u8,
    ) -> AppResult<bool> {
        let mut state = self.inner.state.lock().await;
        let batch = find_batch_mut(&mut state, batch_id)?;
        let item = find_item_mut(batch, item_id)?;

        if item.status != UploadStatus::Uploading || item.attempt_count != attempt {
            return Ok(false);
        }
        item.progress_percent = percent.min(100);
        let percent = item.progress_percent;

        self.inner.snapshot.send_replace(Arc::new(state.clone()));
        let _ = self.inner.events.send(BatchEvent::ItemProgress {
            batch_id,
            item_id,
            percent,
        });
        Ok(true)
    }

    /// Claim the first pending item of a batch, in submission order.
    ///
    /// The item moves to `uploading` and its attempt count is incremented; this is
    /// the only place attempts are counted.
    #[tracing::instrument(skip(self))]
    pub async fn claim_next_pending(&self, batch_id: Uuid) -> AppResult<Option<ClaimedItem>> {
        self.mutate(move |batches| {
            let batch = find_batch_mut(batches, batch_id)?;
            let Some(item) = batch
                .items
                .iter_mut()
                .find(|item| item.status == UploadStatus::Pending)
            else {
                return Ok((None, Vec::new()));
            };

            item.status = UploadStatus::Uploading;
            item.attempt_count += 1;
            item.progress_percent = 0;
            item.updated_at = Utc::now();

            let claimed = ClaimedItem {
                batch_id,
                item_id: item.id,
                file_ref: item.file_ref.clone(),
                target_campaign_id: item.target_campaign_id.clone(),
                attempt: item.attempt_count,
            };
            let event = item_event(batch_id, item);
            let batch_status = batch.recompute_status();
            Ok((Some(claimed), vec![with_batch_status(event, batch_status)]))
        })
        .await
    }

    /// Apply the result of an upload attempt.
    ///
    /// Returns `false` without changing anything when the attempt has been
    /// superseded (the item is no longer uploading under the same generation).
    #[tracing::instrument(skip(self, claim, outcome), fields(batch_id = %claim.batch_id, item_id = %claim.item_id, attempt = claim.attempt))]
    pub async fn record_outcome(
        &self,
        claim: &ClaimedItem,
        outcome: Result<String, UploadFailure>,
    ) -> AppResult<bool> {
        let (batch_id, item_id, attempt) = (claim.batch_id, claim.item_id, claim.attempt);

        let applied = self
            .mutate(move |batches| {
                let batch = find_batch_mut(batches, batch_id)?;
                let item = find_item_mut(batch, item_id)?;

                if item.status != UploadStatus::Uploading || item.attempt_count != attempt {
                    tracing::debug!(
                        current_attempt = item.attempt_count,
                        current_status = %item.status,
                        "Discarding stale upload result"
                    );
                    return Ok((false, Vec::new()));
                }

                item.updated_at = Utc::now();
                match outcome {
                    Ok(url) => {
                        item.status = UploadStatus::Completed;
                        item.progress_percent = 100;
                        item.uploaded_url = Some(url);
                        item.last_error = None;
                    }
                    Err(failure) => {
                        item.status = UploadStatus::Failed;
                        item.last_error = Some(ItemError::from(&failure));
                    }
                }

                let event = item_event(batch_id, item);
                let batch_status = batch.recompute_status();
                Ok((true, vec![with_batch_status(event, batch_status)]))
            })
            .await?;

        Ok(applied)
    }

    /// Move failed items selected by `scope` back to `pending`.
    ///
    /// Returns the ids that were requeued; an empty result leaves the store untouched.
    #[tracing::instrument(skip(self))]
    pub async fn requeue_failed(
        &self,
        batch_id: Uuid,
        scope: RequeueScope,
    ) -> AppResult<Vec<Uuid>> {
        self.mutate(move |batches| {
            let batch = find_batch_mut(batches, batch_id)?;
            let mut requeued = Vec::new();
            let mut events = Vec::new();

            for item in batch.items.iter_mut().filter(|item| scope.selects(item)) {
                if scope == RequeueScope::All {
                    item.attempt_count = 0;
                    item.last_error = None;
                }
                item.status = UploadStatus::Pending;
                item.progress_percent = 0;
                item.updated_at = Utc::now();
                requeued.push(item.id);
                events.push(item_event(batch_id, item));
            }

            let batch_status = batch.recompute_status();
            let events = events
                .into_iter()
                .map(|event| with_batch_status(event, batch_status))
                .collect();
            Ok((requeued, events))
        })
        .await
    }

    /// Move one failed item back to `pending` if it is still on attempt `attempt`.
    ///
    /// Used by backoff timers; returns `false` when the item moved on meanwhile.
    pub async fn requeue_item(&self, batch_id: Uuid, item_id: Uuid, attempt: u32) -> AppResult<bool> {
        self.mutate(move |batches| {
            let batch = find_batch_mut(batches, batch_id)?;
            let item = find_item_mut(batch, item_id)?;

            if item.status != UploadStatus::Failed || item.attempt_count != attempt {
                return Ok((false, Vec::new()));
            }

            item.status = UploadStatus::Pending;
            item.progress_percent = 0;
            item.updated_at = Utc::now();

            let event = item_event(batch_id, item);
            let batch_status = batch.recompute_status();
            Ok((true, vec![with_batch_status(event, batch_status)]))
        })
        .await
    }

    /// Remove one batch from history.
    pub async fn remove_batch(&self, batch_id: Uuid) -> AppResult<()> {
        self.mutate(move |batches| {
            let index = batches
                .iter()
                .position(|batch| batch.id == batch_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("Upload batch {} not found", batch_id))
                })?;
            batches.remove(index);
            Ok(((), vec![BatchEvent::BatchRemoved { batch_id }]))
        })
        .await
    }

    /// Remove every completed batch. Returns how many were removed.
    #[tracing::instrument(skip(self))]
    pub async fn clear_history(&self) -> AppResult<usize> {
        let removed = self
            .mutate(|batches| {
                let mut events = Vec::new();
                batches.retain(|batch| {
                    let keep = batch.status() != BatchStatus::Completed;
                    if !keep {
                        events.push(BatchEvent::BatchRemoved { batch_id: batch.id });
                    }
                    keep
                });
                Ok((events.len(), events))
            })
            .await?;

        tracing::info!(removed, "Cleared completed upload history");
        Ok(removed)
    }

    /// Apply `change` to a copy of the state, persist it, then commit and publish.
    ///
    /// A change that yields no events is treated as a no-op and not persisted.
    async fn mutate<T, F>(&self, change: F) -> AppResult<T>
    where
        F: FnOnce(&mut Vec<UploadBatch>) -> AppResult<(T, Vec<BatchEvent>)>,
    {
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        let (output, mut events) = change(&mut next)?;
        if events.is_empty() {
            return Ok(output);
        }

        let evicted = self.persist(&mut next).await?;
        events.extend(
            evicted
                .into_iter()
                .map(|batch_id| BatchEvent::BatchRemoved { batch_id }),
        );

        *state = next;
        self.inner.snapshot.send_replace(Arc::new(state.clone()));
        for event in events {
            // No subscribers is fine
            let _ = self.inner.events.send(event);
        }
        Ok(output)
    }

    /// Write `batches` to the key-value store, evicting the oldest completed batches
    /// while the store reports its quota is exhausted. Returns the evicted ids.
    async fn persist(&self, batches: &mut Vec<UploadBatch>) -> AppResult<Vec<Uuid>> {
        let mut evicted = Vec::new();
        loop {
            let encoded = serde_json::to_vec(&PersistedBatchesRef {
                version: RECORD_VERSION,
                batches: batches.as_slice(),
            })?;

            match self.inner.kv.set(BATCHES_STORAGE_KEY, encoded).await {
                Ok(()) => return Ok(evicted),
                Err(e) if e.is_quota_exceeded() => {
                    let oldest_completed = batches
                        .iter()
                        .enumerate()
                        .filter(|(_, batch)| batch.status() == BatchStatus::Completed)
                        .min_by_key(|(_, batch)| batch.created_at)
                        .map(|(index, _)| index);

                    match oldest_completed {
                        Some(index) => {
                            let batch = batches.remove(index);
                            tracing::warn!(
                                batch_id = %batch.id,
                                error = %e,
                                "Storage quota exceeded, evicting oldest completed batch"
                            );
                            evicted.push(batch.id);
                        }
                        None => {
                            tracing::warn!(error = %e, "Storage quota exceeded, nothing left to evict");
                            return Err(AppError::StorageQuotaExceeded(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to persist upload batches");
                    return Err(AppError::Storage(e.to_string()));
                }
            }
        }
    }
}

fn find_batch_mut(batches: &mut [UploadBatch], batch_id: Uuid) -> AppResult<&mut UploadBatch> {
    batches
        .iter_mut()
        .find(|batch| batch.id == batch_id)
        .ok_or_else(|| AppError::NotFound(format!("Upload batch {} not found", batch_id)))
}

fn find_item_mut(batch: &mut UploadBatch, item_id: Uuid) -> AppResult<&mut UploadItem> {
    let batch_id = batch.id;
    batch.item_mut(item_id).ok_or_else(|| {
        AppError::NotFound(format!(
            "Upload item {} not found in batch {}",
            item_id, batch_id
        ))
    })
}

fn item_event(batch_id: Uuid, item: &UploadItem) -> BatchEvent {
    BatchEvent::ItemUpdated {
        batch_id,
        item_id: item.id,
        item_status: item.status,
        batch_status: BatchStatus::Pending,
        attempt_count: item.attempt_count,
        error: item.last_error.clone(),
    }
}

fn with_batch_status(event: BatchEvent, status: BatchStatus) -> BatchEvent {
    match event {
        BatchEvent::ItemUpdated {
            batch_id,
            item_id,
            item_status,
            attempt_count,
            error,
            ..
        } => BatchEvent::ItemUpdated {
            batch_id,
            item_id,
            item_status,
            batch_status: status,
            attempt_count,
            error,
        },
        other => other,
    }
}
