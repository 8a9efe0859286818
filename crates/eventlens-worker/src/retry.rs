//! Retry orchestration: eligibility, backoff and re-submission of failed uploads.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use eventlens_core::models::{ItemError, NewUploadItem, UploadBatch, UploadStatus};
use eventlens_core::{AppError, AppResult, PipelineConfig};
use eventlens_db::{BatchEvent, RequeueScope, UploadBatchStore};

use crate::queue::UploadQueue;

/// Attempt ceiling and backoff curve for failed uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.upload_max_attempts,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before retrying an item that has failed `attempt_count` times:
    /// `base_delay * 2^attempt_count`, capped at `max_delay`.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        2u32.checked_pow(attempt_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether an item that just failed with `error` after `attempt_count` attempts
    /// should be retried without user involvement.
    pub fn allows_automatic_retry(&self, attempt_count: u32, error: Option<&ItemError>) -> bool {
        attempt_count < self.max_attempts && error.map_or(true, |e| e.recoverable)
    }
}

/// Who asked for a retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryMode {
    /// Only failed items that are recoverable and under the attempt ceiling.
    Automatic,
    /// Every failed item; attempt counts are reset so exhausted items run again.
    UserInitiated,
}

#[derive(Clone)]
pub struct RetryOrchestrator {
    store: UploadBatchStore,
    queue: UploadQueue,
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(queue: UploadQueue, policy: RetryPolicy) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &UploadBatchStore {
        &self.store
    }

    /// Create a batch and start uploading it.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn submit(&self, items: Vec<NewUploadItem>) -> AppResult<Uuid> {
        let batch_id = self.store.create_batch(items).await?;
        self.queue.dispatch(batch_id).await;
        Ok(batch_id)
    }

    /// Requeue the retry-eligible items of `batch_id` and dispatch them.
    ///
    /// Fails with `NoEligibleItems` and leaves the batch untouched when nothing
    /// qualifies.
    pub async fn retry_failed_uploads(&self, batch_id: Uuid) -> AppResult<usize> {
        self.retry(batch_id, RetryMode::Automatic).await
    }

    /// Requeue every failed item of `batch_id`, including exhausted ones.
    pub async fn retry_exhausted_uploads(&self, batch_id: Uuid) -> AppResult<usize> {
        self.retry(batch_id, RetryMode::UserInitiated).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, batch_id: Uuid, mode: RetryMode) -> AppResult<usize> {
        let scope = match mode {
            RetryMode::Automatic => RequeueScope::Eligible {
                max_attempts: self.policy.max_attempts,
            },
            RetryMode::UserInitiated => RequeueScope::All,
        };

        let requeued = self.store.requeue_failed(batch_id, scope).await?;
        if requeued.is_empty() {
            return Err(AppError::NoEligibleItems { batch_id });
        }

        tracing::info!(
            batch_id = %batch_id,
            requeued = requeued.len(),
            mode = ?mode,
            "Failed uploads requeued"
        );
        self.queue.dispatch(batch_id).await;
        Ok(requeued.len())
    }

    /// Retry every batch in `failed` or `partially_failed` state.
    ///
    /// Returns the number of items requeued. Safe to call repeatedly: items that
    /// are already pending, uploading or completed are never selected.
    #[tracing::instrument(skip(self))]
    pub async fn retry_all_failed(&self) -> usize {
        let mut total = 0;
        for batch_id in self.store.batches_needing_retry() {
            match self.retry_failed_uploads(batch_id).await {
                Ok(count) => total += count,
                Err(AppError::NoEligibleItems { .. }) => {
                    tracing::debug!(batch_id = %batch_id, "No retry-eligible items in batch");
                }
                Err(e) => {
                    tracing::warn!(batch_id = %batch_id, error = %e, "Failed to retry batch");
                }
            }
        }
        total
    }

    /// Dispatch every batch that still has pending items, e.g. after a reload.
    pub async fn resume_pending(&self) -> usize {
        let batches = self.store.batches_with_pending();
        for batch_id in &batches {
            self.queue.dispatch(*batch_id).await;
        }
        if !batches.is_empty() {
            tracing::info!(batch_count = batches.len(), "Resumed pending uploads");
        }
        batches.len()
    }

    /// Wait until no item of `batch_id` is pending, uploading or awaiting an
    /// automatic retry.
    ///
    /// Only terminates for failed items once they are exhausted or
    /// non-recoverable, so it relies on [`Self::spawn_auto_retry`] running.
    pub async fn wait_until_settled(&self, batch_id: Uuid) -> AppResult<UploadBatch> {
        let mut snapshot = self.store.watch_snapshot();
        loop {
            let batch = snapshot
                .borrow_and_update()
                .iter()
                .find(|batch| batch.id == batch_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::NotFound(format!("Upload batch {} not found", batch_id))
                })?;

            let busy = batch.items.iter().any(|item| {
                matches!(item.status, UploadStatus::Pending | UploadStatus::Uploading)
                    || item.is_retry_eligible(self.policy.max_attempts)
            });
            if !busy {
                return Ok(batch);
            }

            snapshot
                .changed()
                .await
                .map_err(|_| AppError::Internal("Upload batch store was dropped".to_string()))?;
        }
    }

    /// Watch store events and schedule a backoff retry for every item that fails
    /// recoverably below the attempt ceiling.
    ///
    /// Timers are armed even while a background context is active. Whichever of
    /// the timer and a background wake comes first requeues the item; the other
    /// finds it already moved on.
    pub fn spawn_auto_retry(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut events = self.store.subscribe();

        tokio::spawn(async move {
            tracing::debug!(
                max_attempts = orchestrator.policy.max_attempts,
                "Automatic retry started"
            );
            loop {
                match events.recv().await {
                    Ok(BatchEvent::ItemUpdated {
                        batch_id,
                        item_id,
                        item_status: UploadStatus::Failed,
                        attempt_count,
                        error,
                        ..
                    }) => {
                        orchestrator.on_item_failed(batch_id, item_id, attempt_count, error);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let armed = orchestrator.rearm_from_snapshot();
                        tracing::warn!(
                            skipped,
                            armed,
                            "Automatic retry lagged behind store events, rescanned snapshot"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Automatic retry stopped");
        })
    }

    /// Arm a backoff timer for every retry-eligible item in the latest snapshot.
    fn rearm_from_snapshot(&self) -> usize {
        let snapshot = self.store.snapshot();
        let mut armed = 0;
        for batch in snapshot.iter() {
            for item in batch
                .items
                .iter()
                .filter(|item| item.is_retry_eligible(self.policy.max_attempts))
            {
                self.on_item_failed(batch.id, item.id, item.attempt_count, item.last_error.clone());
                armed += 1;
            }
        }
        armed
    }

    fn on_item_failed(
        &self,
        batch_id: Uuid,
        item_id: Uuid,
        attempt_count: u32,
        error: Option<ItemError>,
    ) {
        if !self
            .policy
            .allows_automatic_retry(attempt_count, error.as_ref())
        {
            tracing::error!(
                batch_id = %batch_id,
                item_id = %item_id,
                attempt_count,
                max_attempts = self.policy.max_attempts,
                error = ?error.as_ref().map(|e| &e.message),
                "Upload failed permanently, manual retry required"
            );
            return;
        }

        let delay = self.policy.backoff_for(attempt_count);
        tracing::info!(
            batch_id = %batch_id,
            item_id = %item_id,
            attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling upload retry"
        );

        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match orchestrator
                .store
                .requeue_item(batch_id, item_id, attempt_count)
                .await
            {
                Ok(true) => orchestrator.queue.dispatch(batch_id).await,
                Ok(false) => {
                    tracing::debug!(item_id = %item_id, "Item moved on before backoff elapsed");
                }
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "Backoff retry failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exponential_then_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(8), Duration::from_secs(256));
        assert_eq!(policy.backoff_for(9), Duration::from_secs(300));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(300));
    }

    #[test]
    fn backoff_respects_custom_base() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(1));
    }

    #[test]
    fn automatic_retry_eligibility() {
        let policy = RetryPolicy::default();
        let network = ItemError::from(&eventlens_core::UploadFailure::network("reset"));
        let quota = ItemError::from(&eventlens_core::UploadFailure::quota("full"));
        let forbidden = ItemError::from(&eventlens_core::UploadFailure::server(
            Some(403),
            "forbidden",
        ));
        let unavailable = ItemError::from(&eventlens_core::UploadFailure::server(
            Some(503),
            "unavailable",
        ));

        assert!(policy.allows_automatic_retry(1, Some(&network)));
        assert!(policy.allows_automatic_retry(4, Some(&unavailable)));
        assert!(!policy.allows_automatic_retry(5, Some(&network)));
        assert!(!policy.allows_automatic_retry(1, Some(&quota)));
        assert!(!policy.allows_automatic_retry(1, Some(&forbidden)));
    }
}
