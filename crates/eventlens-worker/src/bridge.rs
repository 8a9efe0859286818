//! Background execution bridge
//!
//! Connects the pipeline to an out-of-process execution context. The bridge is
//! constructed once at startup and handed to whoever needs it; [`start`] runs
//! registration a single time per instance and later calls are no-ops.
//!
//! [`start`]: BackgroundExecutionBridge::start

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use eventlens_core::models::{NotificationPermission, PageMessage, RegistrationState, WorkerMessage};
use eventlens_db::{BatchEvent, UploadBatchStore};

use crate::context::{BackgroundRegistrar, NotificationPermissions};
use crate::retry::RetryOrchestrator;

pub struct BackgroundExecutionBridge {
    orchestrator: RetryOrchestrator,
    state: watch::Sender<RegistrationState>,
    permission: Mutex<Option<NotificationPermission>>,
}

impl BackgroundExecutionBridge {
    pub fn new(orchestrator: RetryOrchestrator) -> Arc<Self> {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Arc::new(Self {
            orchestrator,
            state,
            permission: Mutex::new(None),
        })
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Observe registration state changes.
    pub fn watch_registration(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Register the background context and wire message handling.
    ///
    /// Only the first call attempts registration. A failed registration leaves
    /// the bridge in `Failed` for the rest of its lifetime and the pipeline keeps
    /// working with in-process retries only.
    #[tracing::instrument(skip_all)]
    pub async fn start(self: &Arc<Self>, registrar: &dyn BackgroundRegistrar) -> RegistrationState {
        let claimed = self.state.send_if_modified(|state| {
            if *state == RegistrationState::Unregistered {
                *state = RegistrationState::Registering;
                true
            } else {
                false
            }
        });
        if !claimed {
            let current = self.registration_state();
            tracing::debug!(state = %current, "Background registration already attempted");
            return current;
        }

        match registrar.register().await {
            Ok(channel) => {
                self.spawn_inbound(channel.inbound);
                self.spawn_status_relay(channel.outbound);
                self.state.send_replace(RegistrationState::Active);
                tracing::info!("Background execution context active");
            }
            Err(e) => {
                self.state.send_replace(RegistrationState::Failed);
                tracing::warn!(
                    error = %e,
                    "Background registration failed, continuing with in-process retries only"
                );
            }
        }
        self.registration_state()
    }

    /// Ask for notification permission if the user has not decided yet.
    ///
    /// The answer is cached for the lifetime of the bridge, so a denial is never
    /// prompted again.
    pub async fn request_notification_permission(
        &self,
        permissions: &dyn NotificationPermissions,
    ) -> NotificationPermission {
        let mut cached = self.permission.lock().await;
        if let Some(permission) = *cached {
            return permission;
        }

        let current = permissions.current().await;
        let permission = match current {
            NotificationPermission::Default => {
                let answer = permissions.request().await;
                tracing::info!(permission = ?answer, "Notification permission requested");
                answer
            }
            decided => decided,
        };

        // A dismissed prompt stays `Default`; do not cache so a later load may ask again
        if permission != NotificationPermission::Default {
            *cached = Some(permission);
        }
        permission
    }

    /// Handle one message from the background context.
    ///
    /// Returns the number of items requeued. Items already uploading or completed
    /// are never picked up again, so repeated messages are harmless.
    #[tracing::instrument(skip(self))]
    pub async fn handle_message(&self, message: WorkerMessage) -> usize {
        let requeued = self.orchestrator.retry_all_failed().await;
        tracing::info!(message = %message, requeued, "Background retry handled");
        requeued
    }

    fn spawn_inbound(self: &Arc<Self>, mut inbound: mpsc::Receiver<WorkerMessage>) {
        let bridge = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                bridge.handle_message(message).await;
            }
            tracing::debug!("Background message channel closed");
        });
    }

    fn spawn_status_relay(&self, outbound: mpsc::Sender<PageMessage>) {
        let store = self.orchestrator.store().clone();
        let mut events = store.subscribe();
        tokio::spawn(async move {
            loop {
                let batch_id = match events.recv().await {
                    Ok(BatchEvent::BatchRemoved { .. }) | Ok(BatchEvent::ItemProgress { .. }) => {
                        continue
                    }
                    Ok(event) => event.batch_id(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Status relay lagged behind store events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(message) = upload_status(&store, batch_id) else {
                    continue;
                };
                if outbound.send(message).await.is_err() {
                    tracing::debug!("Background context stopped listening for status");
                    break;
                }
            }
        });
    }
}

fn upload_status(store: &UploadBatchStore, batch_id: uuid::Uuid) -> Option<PageMessage> {
    let batch = store.get_batch(batch_id).ok()?;
    Some(PageMessage::UploadStatus {
        status: batch.status(),
        count: batch.items.len(),
    })
}
