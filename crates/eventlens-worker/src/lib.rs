//! Upload workers for the eventlens pipeline.
//!
//! - [`UploadQueue`] drains pending items of a batch under a concurrency ceiling,
//!   consulting the rate limiter before every upload.
//! - [`RetryOrchestrator`] decides which failed items are retried and when.
//! - [`BackgroundExecutionBridge`] connects the pipeline to an out-of-process
//!   execution context that can ask for retries after connectivity returns.

pub mod bridge;
pub mod context;
pub mod queue;
pub mod retry;

pub use bridge::BackgroundExecutionBridge;
pub use context::{
    BackgroundChannel, BackgroundRegistrar, FixedNotificationPermissions, LocalBackgroundWorker,
    NotificationPermissions, UnavailableRegistrar,
};
pub use queue::{UploadQueue, UploadQueueConfig};
pub use retry::{RetryMode, RetryOrchestrator, RetryPolicy};
