//! Sliding-window rate limiter over the shared store.
//!
//! One sorted set per client (`rl:<id>`) holds request timestamps; each
//! check prunes entries older than the window, then counts. Exceeding the
//! limit places a `block:<id>` marker with its own TTL — further requests
//! are rejected without touching the window until the cooldown lapses.
//!
//! The limiter fails open: if the store is unreachable, requests are
//! allowed. Protection degrades before availability does.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::warn;
use uuid::Uuid;

use pulse_core::settings::RateLimitSettings;
use pulse_core::time::now_millis;
use pulse_store::SharedStore;

fn window_key(client_id: &str) -> String {
    format!("rl:{client_id}")
}

fn block_key(client_id: &str) -> String {
    format!("block:{client_id}")
}

/// Outcome of one rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted; `remaining` requests left in the window.
    Allowed {
        /// Remaining budget in the current window.
        remaining: usize,
    },
    /// Client is blocked for roughly this long.
    Blocked {
        /// Suggested client back-off, milliseconds.
        retry_after_ms: u64,
    },
}

impl RateDecision {
    /// Whether the request was admitted.
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Shared-store-backed sliding-window limiter.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    /// Build a limiter over `store`.
    pub fn new(store: Arc<dyn SharedStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Check and record one request from `client_id`.
    pub async fn check_and_record(&self, client_id: &str) -> RateDecision {
        match self.try_check(client_id).await {
            Ok(decision) => {
                if !decision.is_allowed() {
                    counter!(crate::metrics::RATE_LIMITED_TOTAL).increment(1);
                }
                decision
            }
            Err(e) => {
                // Fail open.
                warn!(client_id, error = %e, "rate-limit check failed, allowing");
                RateDecision::Allowed {
                    remaining: self.settings.max_requests,
                }
            }
        }
    }

    async fn try_check(&self, client_id: &str) -> Result<RateDecision, pulse_store::StoreError> {
        if self.store.exists(&block_key(client_id)).await? {
            return Ok(RateDecision::Blocked {
                retry_after_ms: self.settings.block_ms,
            });
        }

        let now = now_millis();
        let window_start = now - self.settings.window_ms as i64;
        let key = window_key(client_id);
        let _ = self
            .store
            .zremrangebyscore(&key, window_start as f64)
            .await?;
        let used = self.store.zcard(&key).await?;
        if used >= self.settings.max_requests {
            self.store
                .set(
                    &block_key(client_id),
                    "1",
                    Some(Duration::from_millis(self.settings.block_ms)),
                )
                .await?;
            warn!(client_id, used, "rate limit exceeded, blocking");
            return Ok(RateDecision::Blocked {
                retry_after_ms: self.settings.block_ms,
            });
        }

        // Member is unique per request so same-millisecond requests count
        // individually.
        let member = format!("{now}-{}", Uuid::new_v4());
        self.store.zadd(&key, now as f64, &member).await?;
        let _ = self
            .store
            .expire(&key, Duration::from_millis(self.settings.window_ms))
            .await?;
        Ok(RateDecision::Allowed {
            remaining: self.settings.max_requests - used - 1,
        })
    }
}
