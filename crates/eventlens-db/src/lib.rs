//! Eventlens batch store
//!
//! The [`UploadBatchStore`] is the single authoritative, durable record of every
//! upload batch and its items. All mutation goes through it.

pub mod db;

pub use db::{BatchEvent, RequeueScope, UploadBatchStore, BATCHES_STORAGE_KEY};
