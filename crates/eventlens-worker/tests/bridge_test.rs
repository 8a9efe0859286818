//! Background execution bridge tests: message idempotence and background resumption.

mod helpers;

use eventlens_core::models::{
    BatchStatus, NotificationPermission, PageMessage, RegistrationState, WorkerMessage,
};
use eventlens_core::UploadFailure;
use eventlens_worker::{
    BackgroundExecutionBridge, BackgroundRegistrar, FixedNotificationPermissions,
    LocalBackgroundWorker, RetryPolicy,
};
use helpers::uploader::ScriptedUploader;
use helpers::{photos, setup_pipeline, wait_idle};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_duplicate_retry_message_dispatches_once() {
    let uploader = ScriptedUploader::new().fail("a.jpg", vec![UploadFailure::network("reset")]);
    let pipeline = setup_pipeline(uploader, RetryPolicy::default()).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg"]))
        .await
        .unwrap();
    let batch = wait_idle(&pipeline.store, batch_id).await;
    assert_eq!(batch.status(), BatchStatus::Failed);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 1);

    let first = bridge.handle_message(WorkerMessage::RetryUploads).await;
    let second = bridge.handle_message(WorkerMessage::RetryUploads).await;
    assert_eq!(first, 1);
    assert_eq!(second, 0);

    let batch = wait_idle(&pipeline.store, batch_id).await;
    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 2);
    assert_eq!(batch.items[0].attempt_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_restored_retries_before_backoff_elapses() {
    let uploader = ScriptedUploader::new().fail("a.jpg", vec![UploadFailure::network("offline")]);
    let slow_backoff = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(3600),
        max_delay: Duration::from_secs(3600),
    };
    let pipeline = setup_pipeline(uploader, slow_backoff).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());

    let (online_tx, online_rx) = watch::channel(true);
    let worker = LocalBackgroundWorker::new(online_rx, None);
    assert_eq!(bridge.start(&worker).await, RegistrationState::Active);
    let _auto = pipeline.orchestrator.spawn_auto_retry();

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg", "b.jpg"]))
        .await
        .unwrap();
    let batch = wait_idle(&pipeline.store, batch_id).await;
    assert_eq!(batch.status(), BatchStatus::PartiallyFailed);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pipeline.uploader.calls("a.jpg"), 1);

    online_tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    online_tx.send(true).unwrap();

    let batch = tokio::time::timeout(
        Duration::from_secs(60),
        pipeline.orchestrator.wait_until_settled(batch_id),
    )
    .await
    .expect("background wake should retry before the local timer")
    .unwrap();
    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_backs_off_without_background_wake() {
    let uploader = ScriptedUploader::new().fail("a.jpg", vec![UploadFailure::network("reset")]);
    let pipeline = setup_pipeline(uploader, RetryPolicy::default()).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());

    // Online, no periodic wake and no connectivity change ever arrives
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = LocalBackgroundWorker::new(online_rx, None);
    assert_eq!(bridge.start(&worker).await, RegistrationState::Active);
    let _auto = pipeline.orchestrator.spawn_auto_retry();

    let started = tokio::time::Instant::now();
    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg"]))
        .await
        .unwrap();
    let batch = tokio::time::timeout(
        Duration::from_secs(60),
        pipeline.orchestrator.wait_until_settled(batch_id),
    )
    .await
    .expect("network failure should be retried by the local timer")
    .unwrap();

    assert_eq!(batch.status(), BatchStatus::Completed);
    assert_eq!(pipeline.uploader.calls("a.jpg"), 2);
    // One failed attempt: 1s * 2^1
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_status_relayed_to_background_context() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = LocalBackgroundWorker::new(online_rx, None);
    bridge.start(&worker).await;

    let batch_id = pipeline
        .orchestrator
        .submit(photos(&["a.jpg", "b.jpg", "c.jpg"]))
        .await
        .unwrap();
    wait_idle(&pipeline.store, batch_id).await;

    let expected = PageMessage::UploadStatus {
        status: BatchStatus::Completed,
        count: 3,
    };
    for _ in 0..1000 {
        if worker.last_status().await.as_ref() == Some(&expected) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(worker.last_status().await, Some(expected));
}

#[tokio::test]
async fn test_registration_attempted_once() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = LocalBackgroundWorker::new(online_rx, None);

    assert_eq!(bridge.start(&worker).await, RegistrationState::Active);
    assert_eq!(bridge.start(&worker).await, RegistrationState::Active);
    // The worker was only registered once, so a direct registration is refused
    assert!(worker.register().await.is_err());
}

#[tokio::test]
async fn test_denied_notification_not_prompted_again() {
    let pipeline = setup_pipeline(ScriptedUploader::new(), RetryPolicy::default()).await;
    let bridge = BackgroundExecutionBridge::new(pipeline.orchestrator.clone());
    let permissions = FixedNotificationPermissions::new(
        NotificationPermission::Denied,
        NotificationPermission::Granted,
    );

    for _ in 0..3 {
        assert_eq!(
            bridge.request_notification_permission(&permissions).await,
            NotificationPermission::Denied
        );
    }
    assert_eq!(permissions.prompts(), 0);
}
