//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use pulse_core::errors::PulseError;

/// Install the process-global Prometheus recorder and return the render
/// handle. Call once at startup, before any counters are touched.
pub fn install_recorder() -> Result<PrometheusHandle, PulseError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PulseError::FatalConfig(format!("metrics recorder install failed: {e}")))
}

// Metric name constants to avoid typos across modules.

/// Messages delivered to live connections (counter).
pub const MESSAGES_SENT_TOTAL: &str = "pulse_messages_sent_total";
/// Messages parked on offline queues (counter).
pub const MESSAGES_QUEUED_TOTAL: &str = "pulse_messages_queued_total";
/// Messages dropped outright (counter).
pub const MESSAGES_DROPPED_TOTAL: &str = "pulse_messages_dropped_total";
/// Requests rejected by the sliding-window rate limiter (counter).
pub const RATE_LIMITED_TOTAL: &str = "pulse_rate_limited_total";
/// Circuit breaker transitions into the open state (counter).
pub const BREAKER_OPENED_TOTAL: &str = "pulse_breaker_opened_total";
