//! Data models for the upload pipeline
//!
//! Each sub-module represents one area: upload batches and items, the messages
//! exchanged with the background execution context, and rate-limited actions.

mod action;
mod bridge;
mod upload;

// Re-export all models for convenient imports
pub use action::*;
pub use bridge::*;
pub use upload::*;
