//! Circuit breakers for outbound endpoints.
//!
//! Classic three-state breaker: CLOSED counts consecutive failures and
//! trips OPEN at the threshold; OPEN rejects fast until the cooldown
//! lapses, then admits probes one at a time in HALF_OPEN; consecutive
//! probe successes close it again, any probe failure re-opens it.
//! Breaker state is per-instance, not shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use pulse_core::errors::{PulseError, Result};
use pulse_core::settings::BreakerSettings;

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Rejecting fast.
    Open,
    /// Admitting probes.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    probe_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// Point-in-time view of one breaker, for the stats surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures in the closed state.
    pub consecutive_failures: u32,
}

/// One endpoint's circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Build a closed breaker for `name`.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Transitions OPEN to HALF_OPEN
    /// when the cooldown has lapsed. HALF_OPEN admits a single in-flight
    /// probe: further callers are rejected until the probe resolves.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed().as_millis() as u64 >= self.settings.cooldown_ms);
                if cooled {
                    info!(breaker = %self.name, "cooldown lapsed, admitting probes");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_successes = 0;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.probe_successes += 1;
                if inner.probe_successes >= self.settings.success_threshold {
                    info!(breaker = %self.name, "closing after successful probes");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.consecutive_failures, "tripping open");
                    counter!(crate::metrics::BREAKER_OPENED_TOTAL).increment(1);
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, re-opening");
                counter!(crate::metrics::BREAKER_OPENED_TOTAL).increment(1);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_successes = 0;
                inner.probe_in_flight = false;
            }
            BreakerState::Open => {}
        }
    }

    /// Run `op` through the breaker. Rejected-fast calls return
    /// [`PulseError::Capacity`] without invoking `op`.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            return Err(PulseError::Capacity(format!(
                "circuit open for {}",
                self.name
            )));
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

/// Lazily-created breakers keyed by endpoint name.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Registry whose breakers all share `settings`.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `name`, created closed on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.settings)))
            .clone()
    }

    /// Snapshots of every breaker, for the stats surface.
    pub fn snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
