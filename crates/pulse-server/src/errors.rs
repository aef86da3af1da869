//! Server-side error taxonomy.

use pulse_store::StoreError;

/// Errors surfaced by the subscriber-facing components.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Shared store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Subscriber supplied a topic outside the allow-listed grammar.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Connection id is not registered or no longer live.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// Registration without an auth context.
    #[error("auth context is required")]
    MissingAuthContext,
}
