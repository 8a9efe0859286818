//! Eventlens Storage Library
//!
//! This crate provides the two primitives the upload pipeline consumes from its
//! surroundings:
//!
//! - [`KeyValueStore`]: durable get/set used to persist the batch record so it
//!   survives restarts. Implemented by [`LocalKvStore`] (one file per key, atomic
//!   replace) and [`MemoryKvStore`] (tests, ephemeral sessions).
//! - [`FileUploader`]: "upload one file to remote storage, return URL or error".
//!   Implemented by [`LocalUploader`], which copies into a destination directory.
//!
//! # Key format
//!
//! Keys and destinations must not contain `..` or a leading `/`. Validation is
//! centralized in the `keys` module so all backends stay consistent.

pub(crate) mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
pub mod traits;

// Re-export commonly used types
#[cfg(feature = "storage-local")]
pub use local::{LocalKvStore, LocalUploader};
pub use memory::MemoryKvStore;
pub use traits::{FileUploader, KeyValueStore, ProgressSender, StorageError, StorageResult};
