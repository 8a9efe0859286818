//! Upload queue: per-batch drain loop, concurrency ceiling, rate limiting and
//! upload execution.
//!
//! Items are claimed from the [`UploadBatchStore`] one at a time, in submission
//! order. At most `concurrency` uploads of one batch are in flight; a new upload
//! is not started until a slot frees. Every upload is admitted by the
//! [`RateLimiter`] first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

use eventlens_core::models::{ActionType, ClaimedItem, UploadStatus};
use eventlens_core::{AppError, PipelineConfig, UploadFailure};
use eventlens_db::UploadBatchStore;
use eventlens_infra::{RateLimitDecision, RateLimiter};
use eventlens_storage::FileUploader;

#[derive(Clone, Debug)]
pub struct UploadQueueConfig {
    /// Maximum simultaneous uploads per batch.
    pub concurrency: usize,
    /// Upper bound for a single upload call.
    pub upload_timeout: Duration,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            upload_timeout: Duration::from_secs(120),
        }
    }
}

impl UploadQueueConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            concurrency: config.upload_concurrency.max(1),
            upload_timeout: config.upload_timeout(),
        }
    }
}

/// Per-batch slots. The semaphore outlives individual drain loops so uploads
/// started by an earlier drain still count against the ceiling.
struct BatchSlots {
    semaphore: Arc<Semaphore>,
    draining: bool,
    rerun: bool,
}

#[derive(Clone)]
pub struct UploadQueue {
    store: UploadBatchStore,
    uploader: Arc<dyn FileUploader>,
    rate_limiter: RateLimiter,
    config: UploadQueueConfig,
    slots: Arc<Mutex<HashMap<Uuid, BatchSlots>>>,
}

impl UploadQueue {
    pub fn new(
        store: UploadBatchStore,
        uploader: Arc<dyn FileUploader>,
        rate_limiter: RateLimiter,
        config: UploadQueueConfig,
    ) -> Self {
        Self {
            store,
            uploader,
            rate_limiter,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &UploadBatchStore {
        &self.store
    }

    /// Start draining the pending items of `batch_id`.
    ///
    /// Returns immediately. If a drain loop is already running for the batch it
    /// is asked to look again instead of starting a second one.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, batch_id: Uuid) {
        let semaphore = {
            let mut slots = self.slots.lock().await;
            let entry = slots.entry(batch_id).or_insert_with(|| BatchSlots {
                semaphore: Arc::new(Semaphore::new(self.config.concurrency)),
                draining: false,
                rerun: false,
            });
            if entry.draining {
                entry.rerun = true;
                tracing::trace!(batch_id = %batch_id, "Drain already running, requested rerun");
                return;
            }
            entry.draining = true;
            entry.rerun = false;
            entry.semaphore.clone()
        };

        let queue = self.clone();
        tokio::spawn(async move {
            queue.drain(batch_id, semaphore).await;
        });
    }

    /// Number of uploads of `batch_id` currently holding a slot.
    pub async fn in_flight(&self, batch_id: Uuid) -> usize {
        let slots = self.slots.lock().await;
        slots
            .get(&batch_id)
            .map(|s| self.config.concurrency - s.semaphore.available_permits())
            .unwrap_or(0)
    }

    async fn drain(&self, batch_id: Uuid, semaphore: Arc<Semaphore>) {
        tracing::debug!(
            batch_id = %batch_id,
            concurrency = self.config.concurrency,
            "Upload drain started"
        );

        loop {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let campaign = self.store.snapshot().iter().find(|b| b.id == batch_id).and_then(|b| {
                b.items
                    .iter()
                    .find(|item| item.status == UploadStatus::Pending)
                    .map(|item| item.target_campaign_id.clone())
            });

            let Some(campaign) = campaign else {
                drop(permit);
                if self.finish_drain(batch_id).await {
                    break;
                }
                continue;
            };

            let key = ActionType::Upload.key(Some(&campaign));
            if let RateLimitDecision::Denied {
                retry_after_seconds,
            } = self.rate_limiter.check_and_record(&key, &ActionType::Upload).await
            {
                drop(permit);
                tracing::debug!(
                    batch_id = %batch_id,
                    retry_after_seconds,
                    "Upload rate limited, pausing drain"
                );
                tokio::time::sleep(Duration::from_secs(retry_after_seconds)).await;
                continue;
            }

            match self.store.claim_next_pending(batch_id).await {
                Ok(Some(claim)) => {
                    let queue = self.clone();
                    tokio::spawn(async move {
                        run_upload(
                            queue.store.clone(),
                            queue.uploader.clone(),
                            claim,
                            queue.config.upload_timeout,
                        )
                        .await;
                        drop(permit);
                        queue.release_if_idle(batch_id).await;
                    });
                }
                Ok(None) => {
                    // The pending item went away after admission
                    drop(permit);
                    self.rate_limiter.refund(&key).await;
                }
                Err(AppError::NotFound(_)) => {
                    drop(permit);
                    self.rate_limiter.refund(&key).await;
                    tracing::debug!(batch_id = %batch_id, "Batch removed, stopping drain");
                    self.mark_idle(batch_id).await;
                    return;
                }
                Err(e) => {
                    drop(permit);
                    self.rate_limiter.refund(&key).await;
                    tracing::error!(
                        batch_id = %batch_id,
                        error = %e,
                        "Failed to claim pending upload, stopping drain"
                    );
                    self.mark_idle(batch_id).await;
                    return;
                }
            }
        }

        tracing::debug!(batch_id = %batch_id, "Upload drain finished");
    }

    /// Returns `true` when the drain may stop, `false` when a rerun was requested.
    async fn finish_drain(&self, batch_id: Uuid) -> bool {
        let mut slots = self.slots.lock().await;
        let Some(entry) = slots.get_mut(&batch_id) else {
            return true;
        };
        if entry.rerun {
            entry.rerun = false;
            return false;
        }
        entry.draining = false;
        if entry.semaphore.available_permits() == self.config.concurrency {
            slots.remove(&batch_id);
        }
        true
    }

    async fn mark_idle(&self, batch_id: Uuid) {
        let mut slots = self.slots.lock().await;
        let Some(entry) = slots.get_mut(&batch_id) else {
            return;
        };
        entry.draining = false;
        entry.rerun = false;
        if entry.semaphore.available_permits() == self.config.concurrency {
            slots.remove(&batch_id);
        }
    }

    /// Forget the slots of a batch once no drain runs and no upload holds a
    /// permit. A later dispatch starts from a fresh semaphore.
    async fn release_if_idle(&self, batch_id: Uuid) {
        let mut slots = self.slots.lock().await;
        let idle = slots.get(&batch_id).is_some_and(|entry| {
            !entry.draining && entry.semaphore.available_permits() == self.config.concurrency
        });
        if idle {
            slots.remove(&batch_id);
            tracing::trace!(batch_id = %batch_id, "Released idle batch slots");
        }
    }

    /// Number of batches with live slot state.
    pub async fn tracked_batches(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[tracing::instrument(skip(store, uploader, claim), fields(batch_id = %claim.batch_id, item_id = %claim.item_id, attempt = claim.attempt))]
async fn run_upload(
    store: UploadBatchStore,
    uploader: Arc<dyn FileUploader>,
    claim: ClaimedItem,
    timeout: Duration,
) {
    let (progress_tx, mut progress_rx) = watch::channel(0u8);

    let progress_store = store.clone();
    let progress_claim = claim.clone();
    let forwarder = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let percent = *progress_rx.borrow_and_update();
            if let Err(e) = progress_store
                .update_item_progress(
                    progress_claim.batch_id,
                    progress_claim.item_id,
                    progress_claim.attempt,
                    percent,
                )
                .await
            {
                tracing::debug!(error = %e, "Dropping progress update");
                break;
            }
        }
    });

    tracing::debug!(file = %claim.file_ref, campaign = %claim.target_campaign_id, "Upload started");

    let result = tokio::time::timeout(
        timeout,
        uploader.upload(&claim.file_ref, &claim.target_campaign_id, &progress_tx),
    )
    .await;
    drop(progress_tx);
    let _ = forwarder.await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(_) => Err(UploadFailure::network(format!(
            "Upload timed out after {}s",
            timeout.as_secs()
        ))),
    };

    match &outcome {
        Ok(url) => tracing::info!(url = %url, "Upload completed"),
        Err(failure) => tracing::warn!(
            error = %failure,
            recoverable = failure.is_recoverable(),
            "Upload attempt failed"
        ),
    }

    match store.record_outcome(&claim, outcome).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!("Upload result superseded by a newer attempt"),
        Err(e) => tracing::error!(error = %e, "Failed to record upload outcome"),
    }
}
