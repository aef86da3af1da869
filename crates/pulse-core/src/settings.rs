//! Layered runtime settings.
//!
//! Settings are loaded from three layers (in priority order):
//!
//! 1. **Compiled defaults** — [`PulseSettings::default()`]
//! 2. **JSON file** — optional path passed to [`PulseSettings::load`]
//! 3. **Environment variables** — `PULSE_*` overrides (highest priority)
//!
//! [`PulseSettings::validate`] surfaces fatal configuration errors (missing
//! shared-store address) before any component starts; these are never
//! retried.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::PulseError;
use crate::retry::RetryConfig;

/// Significance thresholds for one numeric category.
///
/// A change is significant iff `|changePercent| >= min_percent` OR
/// `|changeAbsolute| >= min_absolute` (when the absolute bound is set).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryThreshold {
    /// Minimum absolute percent change.
    pub min_percent: f64,
    /// Minimum absolute value change; `None` disables the absolute arm.
    pub min_absolute: Option<f64>,
}

impl Default for CategoryThreshold {
    fn default() -> Self {
        Self {
            min_percent: 1.0,
            min_absolute: Some(10_000.0),
        }
    }
}

/// Per-category detection thresholds. Structural changes bypass thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdSettings {
    /// Thresholds for `value-metric` series.
    pub value_metric: CategoryThreshold,
    /// Thresholds for `identity-metric` series.
    pub identity_metric: CategoryThreshold,
}

/// Shared external store connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store address. Required; empty at startup is a fatal error.
    pub url: String,
    /// Timeout applied to every store round trip, milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".into(),
            op_timeout_ms: 2_000,
        }
    }
}

/// State-cache TTLs (seconds).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Previous-value TTL, refreshed on each update.
    pub previous_value_ttl_secs: u64,
    /// Dedup-marker TTL.
    pub dedup_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            previous_value_ttl_secs: 3_600,
            dedup_ttl_secs: 300,
        }
    }
}

/// Connection registry settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Heartbeat liveness window, milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Absolute record TTL safety net, seconds.
    pub record_ttl_secs: u64,
    /// Reaper scan interval, milliseconds.
    pub reaper_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            record_ttl_secs: 86_400,
            reaper_interval_ms: 30_000,
        }
    }
}

/// Message delivery settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Connections per concurrent fan-out chunk.
    pub batch_size: usize,
    /// Per-connection offline queue cap; oldest entries dropped beyond it.
    pub queue_cap: usize,
    /// Offline queue TTL, seconds.
    pub queue_ttl_secs: u64,
    /// Transport send timeout, milliseconds.
    pub send_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            queue_cap: 100,
            queue_ttl_secs: 3_600,
            send_timeout_ms: 2_000,
        }
    }
}

/// Sliding-window rate limit settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Window length, milliseconds.
    pub window_ms: u64,
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Cooldown applied when the limit is exceeded, milliseconds.
    pub block_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            block_ms: 300_000,
        }
    }
}

/// Circuit breaker settings for outbound endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it.
    pub success_threshold: u32,
    /// Open-state cooldown, milliseconds.
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 60_000,
        }
    }
}

/// Top-level settings for all pulse components.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Shared store connection.
    pub store: StoreSettings,
    /// Change detection thresholds.
    pub thresholds: ThresholdSettings,
    /// State-cache TTLs.
    pub cache: CacheSettings,
    /// Distributor retry policy.
    pub retry: RetryConfig,
    /// Connection registry.
    pub connections: ConnectionSettings,
    /// Message delivery.
    pub delivery: DeliverySettings,
    /// Rate limiting.
    pub rate_limit: RateLimitSettings,
    /// Circuit breaking.
    pub breaker: BreakerSettings,
}

impl PulseSettings {
    /// Load settings: defaults, deep-merged file (if given), env overrides.
    ///
    /// A missing or unreadable file falls back to defaults with a warning;
    /// a *malformed* file is a fatal configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self, PulseError> {
        let mut settings = match path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                    PulseError::FatalConfig(format!("malformed settings file {}: {e}", p.display()))
                })?,
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "settings file unreadable, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply `PULSE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PULSE_STORE_URL") {
            self.store.url = url;
        }
        if let Some(ms) = env_u64("PULSE_STORE_OP_TIMEOUT_MS") {
            self.store.op_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("PULSE_HEARTBEAT_TIMEOUT_MS") {
            self.connections.heartbeat_timeout_ms = ms;
        }
        if let Some(n) = env_u64("PULSE_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = n as usize;
        }
    }

    /// Validate startup-required settings.
    ///
    /// Returns [`PulseError::FatalConfig`] for anything that must prevent
    /// the component from starting.
    pub fn validate(&self) -> Result<(), PulseError> {
        if self.store.url.trim().is_empty() {
            return Err(PulseError::FatalConfig("store url is required".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PulseError::FatalConfig(
                "retry maxAttempts must be at least 1".into(),
            ));
        }
        if self.delivery.queue_cap == 0 || self.delivery.batch_size == 0 {
            return Err(PulseError::FatalConfig(
                "delivery queueCap and batchSize must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Store op timeout as a [`Duration`].
    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store.op_timeout_ms)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
