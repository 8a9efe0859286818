#![allow(dead_code)]

pub mod uploader;

use eventlens_core::models::{NewUploadItem, UploadBatch, UploadStatus};
use eventlens_core::{RateLimitConfig, RateLimitRule};
use eventlens_core::models::ActionType;
use eventlens_db::UploadBatchStore;
use eventlens_infra::RateLimiter;
use eventlens_storage::MemoryKvStore;
use eventlens_worker::{RetryOrchestrator, RetryPolicy, UploadQueue, UploadQueueConfig};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use uploader::ScriptedUploader;

/// Pipeline wired over in-memory storage and a scripted uploader.
pub struct TestPipeline {
    pub kv: MemoryKvStore,
    pub store: UploadBatchStore,
    pub uploader: Arc<ScriptedUploader>,
    pub orchestrator: RetryOrchestrator,
}

pub async fn setup_pipeline(uploader: ScriptedUploader, policy: RetryPolicy) -> TestPipeline {
    let kv = MemoryKvStore::new();
    let store = UploadBatchStore::open(Arc::new(kv.clone())).await;
    let uploader = Arc::new(uploader);
    let limiter = RateLimiter::new(
        RateLimitConfig::default().with_rule(ActionType::Upload, RateLimitRule::new(1000, 60)),
    );
    let queue = UploadQueue::new(
        store.clone(),
        uploader.clone(),
        limiter,
        UploadQueueConfig::default(),
    );
    let orchestrator = RetryOrchestrator::new(queue, policy);

    TestPipeline {
        kv,
        store,
        uploader,
        orchestrator,
    }
}

/// Short backoff so paused-clock tests advance quickly.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
    }
}

pub fn photos(names: &[&str]) -> Vec<NewUploadItem> {
    names
        .iter()
        .map(|name| NewUploadItem::new(format!("/photos/{}", name), "campaign-1"))
        .collect()
}

/// Wait until no item of the batch is pending or uploading.
pub async fn wait_idle(store: &UploadBatchStore, batch_id: Uuid) -> UploadBatch {
    let mut rx = store.watch_snapshot();
    loop {
        let batch = rx
            .borrow_and_update()
            .iter()
            .find(|b| b.id == batch_id)
            .cloned()
            .expect("batch exists");
        let busy = batch
            .items
            .iter()
            .any(|i| matches!(i.status, UploadStatus::Pending | UploadStatus::Uploading));
        if !busy {
            return batch;
        }
        rx.changed().await.expect("store alive");
    }
}
