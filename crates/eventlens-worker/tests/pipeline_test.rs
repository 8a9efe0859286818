//! End-to-end upload pipeline tests over in-memory storage.

mod helpers;

use eventlens_core::models::{BatchStatus, UploadStatus};
use eventlens_core::{AppError, UploadFailure};
use eventlens_db::{BatchEvent, RequeueScope, UploadBatchStore};
use eventlens_worker::RetryPolicy;
use helpers::uploader::ScriptedUploader;
use helpers::{fast_policy, photos, setup_pipeline, wait_idle};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_partial_failure_then_manual_retry_completes() {
    let uploader = ScriptedUploader::new().fail("b.jpg", vec![UploadFailure::network("reset")]);
    let pipeline = setup_pipeline(uploader, RetryPolicy::default()).await;

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg", "b.jpg", "c.jpg"]))
        .await
        .unwrap();
    let batch = wait_idle(&pipeline.store, batch_id).await;

    assert_eq!(batch.status(), BatchStatus::PartiallyFailed);
    let attention = batch.items_needing_attention();
    assert_eq!(attention.len(), 1);
    assert_eq!(attention[0].file_ref.file_name(), "b.jpg");
    let failed_id = attention[0].id;

    let mut events = pipeline.store.subscribe();
    let requeued = pipeline
        .orchestrator
        .retry_failed_uploads(batch_id)
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let mut transitions = Vec::new();
    while transitions.last() != Some(&UploadStatus::Completed) {
        if let BatchEvent::ItemUpdated {
            item_id,
            item_status,
            ..
        } = events.recv().await.unwrap()
        {
            assert_eq!(item_id, failed_id);
            transitions.push(item_status);
        }
    }
    assert_eq!(
        transitions,
        vec![
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Completed
        ]
    );

    let batch = wait_idle(&pipeline.store, batch_id).await;
    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(pipeline.uploader.calls("b.jpg"), 2);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 1);
}

#[tokio::test]
async fn test_retry_without_failures_is_informational() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg"]))
        .await
        .unwrap();
    let before = wait_idle(&pipeline.store, batch_id).await;

    let err = pipeline
        .orchestrator
        .retry_failed_uploads(batch_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoEligibleItems { batch_id: id } if id == batch_id));
    assert!(err.is_informational());

    let after = pipeline.store.get_batch(batch_id).unwrap();
    assert_eq!(after.status(), before.status());
    assert_eq!(after.items[0].attempt_count, before.items[0].attempt_count);
    assert_eq!(after.items[0].updated_at, before.items[0].updated_at);
}

#[tokio::test]
async fn test_persisted_batch_survives_reload() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let batch_id = pipeline
        .store
        .create_batch(photos(&["a.jpg", "b.jpg"]))
        .await
        .unwrap();

    let reloaded = UploadBatchStore::open(Arc::new(pipeline.kv.clone())).await;
    let batches = reloaded.get_all_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].id, batch_id);
    assert_eq!(batches[0].items.len(), 2);
    let original = pipeline.store.get_batch(batch_id).unwrap();
    for (restored, original) in batches[0].items.iter().zip(&original.items) {
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.status, original.status);
    }
}

#[tokio::test]
async fn test_resume_pending_after_reload() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let batch_id = pipeline
        .store
        .create_batch(photos(&["a.jpg", "b.jpg"]))
        .await
        .unwrap();

    assert_eq!(pipeline.orchestrator.resume_pending().await, 1);
    let batch = wait_idle(&pipeline.store, batch_id).await;
    assert_eq!(batch.status(), BatchStatus::Completed);
    assert!(batch.items.iter().all(|i| i.uploaded_url.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_attempts_never_exceed_ceiling() {
    let pipeline = setup_pipeline(
        ScriptedUploader::failing_with(UploadFailure::network("offline")),
        fast_policy(3),
    )
    .await;
    let _auto = pipeline.orchestrator.spawn_auto_retry();

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg"]))
        .await
        .unwrap();
    let batch = pipeline
        .orchestrator
        .wait_until_settled(batch_id)
        .await
        .unwrap();

    assert_eq!(batch.status(), BatchStatus::Failed);
    assert_eq!(batch.items[0].attempt_count, 3);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 3);

    // Exhausted items are left alone by automatic retry
    let err = pipeline
        .orchestrator
        .retry_failed_uploads(batch_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoEligibleItems { .. }));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pipeline.uploader.calls("a.jpg"), 3);
    assert_eq!(
        pipeline.store.get_batch(batch_id).unwrap().items[0].attempt_count,
        3
    );

    // A user retry starts a fresh round
    assert_eq!(
        pipeline
            .orchestrator
            .retry_exhausted_uploads(batch_id)
            .await
            .unwrap(),
        1
    );
    let batch = pipeline
        .orchestrator
        .wait_until_settled(batch_id)
        .await
        .unwrap();
    assert_eq!(batch.items[0].attempt_count, 3);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_server_error_not_retried() {
    let pipeline = setup_pipeline(
        ScriptedUploader::failing_with(UploadFailure::server(Some(404), "campaign not found")),
        fast_policy(5),
    )
    .await;
    let _auto = pipeline.orchestrator.spawn_auto_retry();

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg", "b.jpg"]))
        .await
        .unwrap();
    let batch = pipeline
        .orchestrator
        .wait_until_settled(batch_id)
        .await
        .unwrap();

    assert_eq!(batch.status(), BatchStatus::Failed);
    assert_eq!(pipeline.uploader.total_calls(), 2);
    assert!(batch
        .items
        .iter()
        .all(|i| i.last_error.as_ref().is_some_and(|e| !e.recoverable)));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_with_backoff() {
    let uploader = ScriptedUploader::new().fail(
        "a.jpg",
        vec![
            UploadFailure::server(Some(503), "unavailable"),
            UploadFailure::network("reset"),
        ],
    );
    let pipeline = setup_pipeline(uploader, fast_policy(5)).await;
    let _auto = pipeline.orchestrator.spawn_auto_retry();

    let started = tokio::time::Instant::now();
    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg"]))
        .await
        .unwrap();
    let batch = pipeline
        .orchestrator
        .wait_until_settled(batch_id)
        .await
        .unwrap();

    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(batch.items[0].attempt_count, 3);
    assert!(batch.items[0].last_error.is_none());
    // 10ms * 2^1 + 10ms * 2^2
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test(start_paused = true)]
async fn test_failure_missed_by_lagging_subscriber_is_still_retried() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), fast_policy(5)).await;

    // A large batch whose items all failed permanently
    let names: Vec<String> = (0..300).map(|i| format!("flood-{}.jpg", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let flood_id = pipeline.store.create_batch(photos(&names)).await.unwrap();
    while let Some(claim) = pipeline.store.claim_next_pending(flood_id).await.unwrap() {
        pipeline
            .store
            .record_outcome(&claim, Err(UploadFailure::server(Some(404), "gone")))
            .await
            .unwrap();
    }

    let _auto = pipeline.orchestrator.spawn_auto_retry();

    // Fail one item, then requeue the large batch in one commit so the failure
    // event is pushed out of the channel before the retry task reads it
    let batch_id = tokio::task::unconstrained(async {
        let batch_id = pipeline
            .store
            .create_batch(photos(&["a.jpg"]))
            .await
            .unwrap();
        let claim = pipeline
            .store
            .claim_next_pending(batch_id)
            .await
            .unwrap()
            .unwrap();
        pipeline
            .store
            .record_outcome(&claim, Err(UploadFailure::network("reset")))
            .await
            .unwrap();
        let requeued = pipeline
            .store
            .requeue_failed(flood_id, RequeueScope::All)
            .await
            .unwrap();
        assert_eq!(requeued.len(), 300);
        batch_id
    })
    .await;

    let batch = tokio::time::timeout(
        Duration::from_secs(30),
        pipeline.orchestrator.wait_until_settled(batch_id),
    )
    .await
    .expect("failed item was never retried")
    .unwrap();

    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(batch.items[0].attempt_count, 2);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 1);
}
