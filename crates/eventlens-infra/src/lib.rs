//! Eventlens Infrastructure Library
//!
//! Shared infrastructure used by the upload pipeline and its front ends:
//! - Client-side rate limiting
//! - Telemetry initialization

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};

#[cfg(feature = "rate-limit")]
pub use rate_limit::{RateLimitDecision, RateLimiter};
