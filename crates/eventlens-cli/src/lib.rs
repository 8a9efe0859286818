//! Wiring and rendering helpers for the `eventlens` binary.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;

use eventlens_core::models::{BatchStatus, UploadBatch, UploadStatus};
use eventlens_core::PipelineConfig;
use eventlens_db::UploadBatchStore;
use eventlens_infra::RateLimiter;
use eventlens_storage::{LocalKvStore, LocalUploader};
use eventlens_worker::{
    BackgroundExecutionBridge, RetryOrchestrator, RetryPolicy, UploadQueue, UploadQueueConfig,
};

/// Every long-lived component, constructed once per process.
pub struct Pipeline {
    pub store: UploadBatchStore,
    pub orchestrator: RetryOrchestrator,
    pub bridge: Arc<BackgroundExecutionBridge>,
}

/// Open the persisted store under `state_dir` and wire the dispatcher, retry
/// orchestrator and bridge around it. Nothing is started yet.
pub async fn build_pipeline(config: &PipelineConfig) -> anyhow::Result<Pipeline> {
    let kv = LocalKvStore::new(&config.state_dir)
        .await
        .with_context(|| format!("Failed to open state directory {}", config.state_dir.display()))?
        .with_quota(config.storage_quota_bytes);
    let store = UploadBatchStore::open(Arc::new(kv)).await;

    let base_url = format!("file://{}", config.upload_dir.display());
    let uploader = LocalUploader::new(&config.upload_dir, base_url)
        .await
        .with_context(|| {
            format!(
                "Failed to open upload directory {}",
                config.upload_dir.display()
            )
        })?;

    let queue = UploadQueue::new(
        store.clone(),
        Arc::new(uploader),
        RateLimiter::new(config.rate_limits.clone()),
        UploadQueueConfig::from_config(config),
    );
    let orchestrator = RetryOrchestrator::new(queue, RetryPolicy::from_config(config));
    let bridge = BackgroundExecutionBridge::new(orchestrator.clone());

    Ok(Pipeline {
        store,
        orchestrator,
        bridge,
    })
}

/// One row of `eventlens list`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub id: String,
    pub created_at: String,
    pub status: BatchStatus,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl From<&UploadBatch> for BatchSummary {
    fn from(batch: &UploadBatch) -> Self {
        Self {
            id: batch.id.to_string(),
            created_at: batch.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            status: batch.status(),
            completed: batch.count_with_status(UploadStatus::Completed),
            failed: batch.count_with_status(UploadStatus::Failed),
            total: batch.items.len(),
        }
    }
}

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Render a batch and its items as plain text.
pub fn render_batch(batch: &UploadBatch) -> String {
    let mut out = format!(
        "Batch {} ({}), created {}\n",
        batch.id,
        batch.status(),
        batch.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    for item in &batch.items {
        out.push_str(&format!(
            "  {:<32} {:<10} {:>3}%  attempts={}",
            truncate_string(item.file_ref.file_name(), 32),
            item.status.to_string(),
            item.progress_percent,
            item.attempt_count
        ));
        if let Some(error) = &item.last_error {
            out.push_str(&format!("  error={}", truncate_string(&error.message, 60)));
        }
        out.push('\n');
    }

    let attention = batch.items_needing_attention();
    if !attention.is_empty() {
        out.push_str(&format!("{} item(s) need attention\n", attention.len()));
    }
    out
}
