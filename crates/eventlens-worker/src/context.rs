//! Background execution context seams
//!
//! The bridge never calls into the background context directly. Registration
//! hands back a pair of channels and all coordination is message passing over
//! them. [`LocalBackgroundWorker`] is an in-process implementation that runs
//! as its own task and owns its own state.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use eventlens_core::models::{NotificationPermission, PageMessage, WorkerMessage};

const CHANNEL_CAPACITY: usize = 32;

/// Message handles returned by a successful registration.
pub struct BackgroundChannel {
    /// Page to background context.
    pub outbound: mpsc::Sender<PageMessage>,
    /// Background context to page.
    pub inbound: mpsc::Receiver<WorkerMessage>,
}

/// Registers the out-of-page execution context.
#[async_trait]
pub trait BackgroundRegistrar: Send + Sync {
    async fn register(&self) -> Result<BackgroundChannel>;
}

/// User-visible notification permission primitive.
#[async_trait]
pub trait NotificationPermissions: Send + Sync {
    async fn current(&self) -> NotificationPermission;

    /// Prompt the user. Only called while the permission is `Default`.
    async fn request(&self) -> NotificationPermission;
}

/// Registrar for environments without background execution support.
/// Registration always fails.
pub struct UnavailableRegistrar;

#[async_trait]
impl BackgroundRegistrar for UnavailableRegistrar {
    async fn register(&self) -> Result<BackgroundChannel> {
        Err(anyhow!("Background execution is not available"))
    }
}

/// Permission source with a fixed current value and a fixed prompt answer.
pub struct FixedNotificationPermissions {
    current: Mutex<NotificationPermission>,
    answer: NotificationPermission,
    prompts: AtomicUsize,
}

impl FixedNotificationPermissions {
    pub fn new(current: NotificationPermission, answer: NotificationPermission) -> Self {
        Self {
            current: Mutex::new(current),
            answer,
            prompts: AtomicUsize::new(0),
        }
    }

    /// How many times the user was prompted.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationPermissions for FixedNotificationPermissions {
    async fn current(&self) -> NotificationPermission {
        *self.current.lock().await
    }

    async fn request(&self) -> NotificationPermission {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut current = self.current.lock().await;
        *current = self.answer;
        self.answer
    }
}

/// In-process background execution context.
///
/// Registration spawns a task that:
/// - sends `BACKGROUND_SYNC_RETRY` when connectivity goes from offline to online,
/// - sends `RETRY_UPLOADS` every `sync_interval` (if set),
/// - keeps the last `UPLOAD_STATUS` it received.
pub struct LocalBackgroundWorker {
    connectivity: watch::Receiver<bool>,
    sync_interval: Option<Duration>,
    last_status: Arc<Mutex<Option<PageMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBackgroundWorker {
    /// `connectivity` carries `true` while online.
    pub fn new(connectivity: watch::Receiver<bool>, sync_interval: Option<Duration>) -> Self {
        Self {
            connectivity,
            sync_interval,
            last_status: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
        }
    }

    /// Last status pushed by the page, if any.
    pub async fn last_status(&self) -> Option<PageMessage> {
        self.last_status.lock().await.clone()
    }

    async fn run(
        mut connectivity: watch::Receiver<bool>,
        mut online: bool,
        sync_interval: Option<Duration>,
        last_status: Arc<Mutex<Option<PageMessage>>>,
        mut from_page: mpsc::Receiver<PageMessage>,
        to_page: mpsc::Sender<WorkerMessage>,
    ) {
        let mut watching = true;
        let mut ticker = sync_interval.map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });

        tracing::info!(
            online,
            sync_interval_secs = sync_interval.map(|d| d.as_secs()),
            "Background execution context started"
        );

        loop {
            let message = tokio::select! {
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        tracing::debug!("Connectivity source closed");
                        watching = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    let restored = !online && now_online;
                    online = now_online;
                    if !restored {
                        continue;
                    }
                    tracing::info!("Connectivity restored");
                    WorkerMessage::BackgroundSyncRetry
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if !online {
                        continue;
                    }
                    WorkerMessage::RetryUploads
                }
                received = from_page.recv() => {
                    match received {
                        Some(message) => {
                            tracing::trace!(message = ?message, "Background context received page message");
                            *last_status.lock().await = Some(message);
                            continue;
                        }
                        None => break,
                    }
                }
            };

            tracing::debug!(message = %message, "Background context requesting retry");
            if to_page.send(message).await.is_err() {
                break;
            }
        }

        tracing::info!("Background execution context stopped");
    }
}

#[async_trait]
impl BackgroundRegistrar for LocalBackgroundWorker {
    async fn register(&self) -> Result<BackgroundChannel> {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(anyhow!("Background execution context already registered"));
        }

        let (outbound, from_page) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_page, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let online = *self.connectivity.borrow();
        *handle = Some(tokio::spawn(Self::run(
            self.connectivity.clone(),
            online,
            self.sync_interval,
            self.last_status.clone(),
            from_page,
            to_page,
        )));

        Ok(BackgroundChannel { outbound, inbound })
    }
}
