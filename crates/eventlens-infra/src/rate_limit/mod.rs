//! Rate limiting service
//!
//! Sliding-window admission control consulted before network-bound actions.
//! Buckets live in memory only and reset with the process.

pub use limiter::{RateLimitDecision, RateLimiter};

mod limiter;
