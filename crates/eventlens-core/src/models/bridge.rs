use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

use super::BatchStatus;

/// Message pushed from the page to the background execution context.
///
/// Informational; no reply is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    UploadStatus { status: BatchStatus, count: usize },
}

/// Message sent by the background execution context to the page.
///
/// Both variants ask the page to retry every batch in `failed` or
/// `partially_failed` state. Handlers must be idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    RetryUploads,
    BackgroundSyncRetry,
}

impl Display for WorkerMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            WorkerMessage::RetryUploads => write!(f, "RETRY_UPLOADS"),
            WorkerMessage::BackgroundSyncRetry => write!(f, "BACKGROUND_SYNC_RETRY"),
        }
    }
}

/// Registration lifecycle of the background execution context.
///
/// `Unregistered -> Registering -> {Active | Failed}`; terminal for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Active,
    Failed,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Active | RegistrationState::Failed)
    }
}

impl Display for RegistrationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Registering => write!(f, "registering"),
            RegistrationState::Active => write!(f, "active"),
            RegistrationState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPermission {
    #[default]
    Default,
    Granted,
    Denied,
}
