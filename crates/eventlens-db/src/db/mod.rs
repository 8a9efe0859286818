//! Repositories for the data access layer
//!
//! `upload_batch` owns the persisted batch record; `events` defines the change
//! notifications it publishes to subscribers.

pub mod events;
pub mod upload_batch;

pub use events::BatchEvent;
pub use upload_batch::{RequeueScope, UploadBatchStore, BATCHES_STORAGE_KEY};
