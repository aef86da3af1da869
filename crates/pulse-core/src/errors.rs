//! Shared error taxonomy.
//!
//! Four families, mapped to how each is handled:
//!
//! - [`PulseError::Validation`] — rejected at the boundary, never enters the
//!   pipeline; reported in batch summaries.
//! - [`PulseError::Transient`] — infrastructure timeouts/unavailability;
//!   retried per component policy, exhaustion dead-letters or skips.
//! - [`PulseError::Capacity`] — rate limit exceeded or a bounded queue at
//!   its cap; rejected or oldest-dropped, never silently queued past the cap.
//! - [`PulseError::FatalConfig`] — missing required configuration at
//!   startup; surfaces immediately and is never retried.

/// Error type shared across the pulse pipeline crates.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Malformed record, message, topic, or filter. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store/broker/queue/transport timeout or unavailability. Retryable.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Rate limit exceeded or a bounded queue is full.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Missing or invalid startup configuration. Prevents startup.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl PulseError {
    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PulseError::Transient(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(PulseError::Transient("store down".into()).is_retryable());
        assert!(!PulseError::Validation("bad record".into()).is_retryable());
        assert!(!PulseError::Capacity("queue full".into()).is_retryable());
        assert!(!PulseError::FatalConfig("no store url".into()).is_retryable());
    }

    #[test]
    fn display_includes_family_prefix() {
        let e = PulseError::Transient("broker unreachable".into());
        assert_eq!(
            e.to_string(),
            "transient infrastructure error: broker unreachable"
        );
    }
}
