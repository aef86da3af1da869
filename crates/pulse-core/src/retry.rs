//! Retry policy with exponential backoff.
//!
//! Shared by the distributor (broker and durable-queue publishes). The
//! delay doubles per attempt from a base, capped at a maximum; attempts are
//! bounded and exhaustion is handled by the caller (dead-letter for the
//! durable queue, log-and-continue for the best-effort broker).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `retry` (0-based: the delay after
    /// the first failed attempt is `delay_for(0)`).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.min(31);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}
