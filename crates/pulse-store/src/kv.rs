//! The [`SharedStore`] trait — handle to the external shared key-value
//! store.
//!
//! The operation families mirror what the pipeline actually needs from a
//! Redis-class store: string values with TTL, unordered sets (connection
//! and room indexes), score-ordered sets (rate-limit windows), and capped
//! lists (per-connection offline queues). Every call is a network round
//! trip from the caller's perspective and must be bounded by the caller's
//! timeout policy.

use std::time::Duration;

use async_trait::async_trait;
use pulse_core::errors::PulseError;

/// Errors from shared-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable or the operation failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The key holds a value of a different kind.
    #[error("wrong value kind for key {0}")]
    WrongType(String),
}

impl From<StoreError> for PulseError {
    fn from(e: StoreError) -> Self {
        PulseError::Transient(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the external shared key-value store.
///
/// One instance per process, injected into each manager (registry, rooms,
/// router, rate limiter, state cache) so tests can substitute doubles and
/// multiple independent instances can coexist in-process.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Get many string values in one pipelined round trip.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Set a string value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Whether a key exists (and has not expired).
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Refresh a key's TTL. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Set cardinality.
    async fn scard(&self, key: &str) -> StoreResult<usize>;

    /// Add a scored member to a sorted set.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;

    /// Remove sorted-set members with score `<= max`. Returns removed count.
    async fn zremrangebyscore(&self, key: &str, max: f64) -> StoreResult<usize>;

    /// Sorted-set cardinality.
    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Push to the head of a list, then trim to `cap` newest entries
    /// (oldest dropped). Returns the resulting length.
    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<usize>;

    /// Pop from the tail of a list (the oldest entry).
    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Push to the tail of a list (the next entry to be popped).
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// List length.
    async fn llen(&self, key: &str) -> StoreResult<usize>;

    /// Reachability probe for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}
