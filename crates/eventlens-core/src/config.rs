//! Configuration module
//!
//! This module provides the configuration for the upload pipeline: where state is
//! persisted, retry and concurrency tuning, and per-action rate-limit windows.
//! Values come from the environment (and an optional `.env` file) with defaults
//! that match the documented behaviour, so every component can also be built with
//! `Default` in tests.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::ActionType;

// Common constants
const UPLOAD_MAX_ATTEMPTS: u32 = 5;
const UPLOAD_CONCURRENCY: usize = 3;
const UPLOAD_RETRY_BASE_DELAY_MS: u64 = 1000;
const UPLOAD_RETRY_MAX_DELAY_SECS: u64 = 300;
const UPLOAD_TIMEOUT_SECS: u64 = 120;
const BACKGROUND_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_STATE_DIR: &str = ".eventlens/state";
const DEFAULT_UPLOAD_DIR: &str = ".eventlens/uploads";

/// Sliding-window limit for one action type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Rate-limit rules keyed by action type, with a fallback for unconfigured types.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    rules: HashMap<ActionType, RateLimitRule>,
    fallback: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let rules = HashMap::from([
            (ActionType::Upload, RateLimitRule::new(10, 60)),
            (ActionType::Payment, RateLimitRule::new(1, 30)),
            (ActionType::Email, RateLimitRule::new(3, 60)),
            (ActionType::FaceSearch, RateLimitRule::new(5, 300)),
        ]);
        Self {
            rules,
            fallback: RateLimitRule::new(10, 60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_rule(mut self, action: ActionType, rule: RateLimitRule) -> Self {
        self.rules.insert(action, rule);
        self
    }

    pub fn with_fallback(mut self, rule: RateLimitRule) -> Self {
        self.fallback = rule;
        self
    }

    /// Rule for `action`, or the fallback when none is configured.
    pub fn rule_for(&self, action: &ActionType) -> RateLimitRule {
        self.rules.get(action).copied().unwrap_or(self.fallback)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        for action in [
            ActionType::Upload,
            ActionType::Payment,
            ActionType::Email,
            ActionType::FaceSearch,
        ] {
            let current = config.rule_for(&action);
            let prefix = format!("RATE_LIMIT_{}", action.to_string().to_uppercase());
            let rule = RateLimitRule {
                max_requests: env_or(&format!("{}_MAX", prefix), current.max_requests),
                window: Duration::from_secs(env_or(
                    &format!("{}_WINDOW_SECS", prefix),
                    current.window.as_secs(),
                )),
            };
            config.rules.insert(action, rule);
        }
        config.fallback = RateLimitRule {
            max_requests: env_or("RATE_LIMIT_DEFAULT_MAX", config.fallback.max_requests),
            window: Duration::from_secs(env_or(
                "RATE_LIMIT_DEFAULT_WINDOW_SECS",
                config.fallback.window.as_secs(),
            )),
        };
        config
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        for (action, rule) in self
            .rules
            .iter()
            .map(|(a, r)| (a.to_string(), r))
            .chain(std::iter::once(("default".to_string(), &self.fallback)))
        {
            if rule.max_requests == 0 {
                return Err(anyhow::anyhow!(
                    "Rate limit for '{}' must allow at least one request",
                    action
                ));
            }
            if rule.window.is_zero() {
                return Err(anyhow::anyhow!(
                    "Rate limit window for '{}' must be greater than zero",
                    action
                ));
            }
        }
        Ok(())
    }
}

/// Upload pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub environment: String,
    /// Directory holding the durable batch record.
    pub state_dir: PathBuf,
    /// Destination root for the local upload primitive.
    pub upload_dir: PathBuf,
    /// Maximum size of the persisted batch record. `None` = unbounded.
    pub storage_quota_bytes: Option<u64>,
    // Retry and dispatch configuration
    pub upload_max_attempts: u32,
    pub upload_concurrency: usize,
    pub upload_retry_base_delay_ms: u64,
    pub upload_retry_max_delay_secs: u64,
    pub upload_timeout_secs: u64,
    /// Periodic wake interval of the background execution context. 0 = disabled.
    pub background_sync_interval_secs: u64,
    pub rate_limits: RateLimitConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            storage_quota_bytes: None,
            upload_max_attempts: UPLOAD_MAX_ATTEMPTS,
            upload_concurrency: UPLOAD_CONCURRENCY,
            upload_retry_base_delay_ms: UPLOAD_RETRY_BASE_DELAY_MS,
            upload_retry_max_delay_secs: UPLOAD_RETRY_MAX_DELAY_SECS,
            upload_timeout_secs: UPLOAD_TIMEOUT_SECS,
            background_sync_interval_secs: BACKGROUND_SYNC_INTERVAL_SECS,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let storage_quota_bytes = match env::var("EVENTLENS_STORAGE_QUOTA_BYTES") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|e| {
                anyhow::anyhow!("EVENTLENS_STORAGE_QUOTA_BYTES must be a number: {}", e)
            })?),
            _ => None,
        };

        let config = Self {
            environment,
            state_dir: env::var("EVENTLENS_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR)),
            upload_dir: env::var("EVENTLENS_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            storage_quota_bytes,
            upload_max_attempts: env_or("UPLOAD_MAX_ATTEMPTS", UPLOAD_MAX_ATTEMPTS),
            upload_concurrency: env_or("UPLOAD_CONCURRENCY", UPLOAD_CONCURRENCY),
            upload_retry_base_delay_ms: env_or(
                "UPLOAD_RETRY_BASE_DELAY_MS",
                UPLOAD_RETRY_BASE_DELAY_MS,
            ),
            upload_retry_max_delay_secs: env_or(
                "UPLOAD_RETRY_MAX_DELAY_SECS",
                UPLOAD_RETRY_MAX_DELAY_SECS,
            ),
            upload_timeout_secs: env_or("UPLOAD_TIMEOUT_SECS", UPLOAD_TIMEOUT_SECS),
            background_sync_interval_secs: env_or(
                "BACKGROUND_SYNC_INTERVAL_SECS",
                BACKGROUND_SYNC_INTERVAL_SECS,
            ),
            rate_limits: RateLimitConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.upload_max_attempts == 0 {
            return Err(anyhow::anyhow!("UPLOAD_MAX_ATTEMPTS must be at least 1"));
        }
        if self.upload_concurrency == 0 {
            return Err(anyhow::anyhow!("UPLOAD_CONCURRENCY must be at least 1"));
        }
        if self.upload_timeout_secs == 0 {
            return Err(anyhow::anyhow!("UPLOAD_TIMEOUT_SECS must be at least 1"));
        }
        if self.retry_base_delay() > self.retry_max_delay() {
            return Err(anyhow::anyhow!(
                "UPLOAD_RETRY_BASE_DELAY_MS ({}ms) exceeds UPLOAD_RETRY_MAX_DELAY_SECS ({}s)",
                self.upload_retry_base_delay_ms,
                self.upload_retry_max_delay_secs
            ));
        }
        self.rate_limits.validate()
    }

    /// Check if the pipeline is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.upload_retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.upload_retry_max_delay_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn background_sync_interval(&self) -> Option<Duration> {
        (self.background_sync_interval_secs > 0)
            .then(|| Duration::from_secs(self.background_sync_interval_secs))
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_or<T: FromStr + ToString>(key: &str, default: T) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .unwrap_or(default)
}
