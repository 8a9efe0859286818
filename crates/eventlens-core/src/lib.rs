//! Eventlens Core Library
//!
//! This crate provides the domain models, error types and configuration shared by
//! every part of the upload pipeline: the batch store, the dispatcher, the retry
//! orchestrator and the background execution bridge.

pub mod config;
pub mod error;
pub mod models;
pub mod upload_error;

// Re-export commonly used types
pub use config::{PipelineConfig, RateLimitConfig, RateLimitRule};
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel};
pub use upload_error::{FailureKind, UploadFailure};
