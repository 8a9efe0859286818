use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use eventlens_core::models::ActionType;
use eventlens_core::{RateLimitConfig, RateLimitRule};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// The window is full; the oldest request leaves it in `retry_after_seconds`.
    Denied { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }

    /// How long to wait before asking again; zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitDecision::Allowed => Duration::ZERO,
            RateLimitDecision::Denied {
                retry_after_seconds,
            } => Duration::from_secs(*retry_after_seconds),
        }
    }
}

/// Request timestamps for one key, oldest first.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<Instant>,
    /// Window of the rule last applied to this key.
    window: Duration,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_and_record(&mut self, now: Instant, rule: RateLimitRule) -> RateLimitDecision {
        self.window = rule.window;
        self.prune(now, rule.window);

        if self.timestamps.len() >= rule.max_requests as usize {
            let wait = self
                .timestamps
                .front()
                .map(|oldest| (*oldest + rule.window).saturating_duration_since(now))
                .unwrap_or(rule.window);
            // Round up so a caller sleeping for the reported time is admitted
            let retry_after_seconds = wait.as_millis().div_ceil(1000).max(1) as u64;
            return RateLimitDecision::Denied {
                retry_after_seconds,
            };
        }

        self.timestamps.push_back(now);
        RateLimitDecision::Allowed
    }
}

/// Sharded sliding-window rate limiter.
///
/// Keys are spread over several shards (separate maps) so unrelated keys rarely
/// contend for the same lock. One bucket per key, created lazily. Clones share
/// buckets, so one limiter can be constructed at startup and handed to every
/// consumer.
#[derive(Clone)]
pub struct RateLimiter {
    shards: Vec<Arc<Mutex<HashMap<String, SlidingWindow>>>>,
    shard_count: usize,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shard_count
    }

    /// Create a rate limiter with the given rules (default 16 shards).
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_shards(config, 16)
    }

    /// Create a rate limiter with a custom shard count.
    pub fn with_shards(config: RateLimitConfig, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Arc::new(Mutex::new(HashMap::new())))
            .collect();
        Self {
            shards,
            shard_count,
            config: Arc::new(config),
        }
    }

    /// Admit or deny one request for `key`, using the window configured for `action`.
    ///
    /// An allowed request is recorded; a denied one is not.
    #[tracing::instrument(skip(self))]
    pub async fn check_and_record(&self, key: &str, action: &ActionType) -> RateLimitDecision {
        let rule = self.config.rule_for(action);
        let shard = &self.shards[self.shard_index(key)];
        let mut buckets = shard.lock().await;
        let now = Instant::now();
        sweep(&mut buckets, now);
        let window = buckets.entry(key.to_string()).or_default();

        let decision = window.check_and_record(now, rule);
        match decision {
            RateLimitDecision::Allowed => {
                tracing::trace!(
                    key = %key,
                    action = %action,
                    in_window = window.timestamps.len(),
                    max_requests = rule.max_requests,
                    "Rate limit admitted request"
                );
            }
            RateLimitDecision::Denied {
                retry_after_seconds,
            } => {
                tracing::warn!(
                    key = %key,
                    action = %action,
                    max_requests = rule.max_requests,
                    window_secs = rule.window.as_secs(),
                    retry_after_seconds,
                    "Rate limit reached, request denied"
                );
            }
        }
        decision
    }

    /// Requests still admissible for `key` in the current window.
    pub async fn remaining(&self, key: &str, action: &ActionType) -> u32 {
        let rule = self.config.rule_for(action);
        let shard = &self.shards[self.shard_index(key)];
        let mut buckets = shard.lock().await;
        let Some(window) = buckets.get_mut(key) else {
            return rule.max_requests;
        };
        window.prune(Instant::now(), rule.window);
        let used = window.timestamps.len() as u32;
        if used == 0 {
            buckets.remove(key);
        }
        rule.max_requests.saturating_sub(used)
    }

    /// Give back the most recent admission for `key`.
    ///
    /// For callers that were admitted but found nothing to do.
    pub async fn refund(&self, key: &str) {
        let shard = &self.shards[self.shard_index(key)];
        let mut buckets = shard.lock().await;
        if let Some(window) = buckets.get_mut(key) {
            window.timestamps.pop_back();
            if window.timestamps.is_empty() {
                buckets.remove(key);
            }
        }
    }

    /// Drop buckets whose requests have all left their window.
    ///
    /// Returns the number of keys still tracked.
    pub async fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut tracked = 0;
        for shard in &self.shards {
            let mut buckets = shard.lock().await;
            sweep(&mut buckets, now);
            tracked += buckets.len();
        }
        tracked
    }
}

fn sweep(buckets: &mut HashMap<String, SlidingWindow>, now: Instant) {
    buckets.retain(|_, window| {
        let period = window.window;
        window.prune(now, period);
        !window.timestamps.is_empty()
    });
}
