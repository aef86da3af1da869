//! Fault-injection wrapper around any [`SharedStore`].
//!
//! Used by resilience tests to flip the shared store between healthy and
//! unavailable mid-scenario, verifying the degraded paths: the detector
//! treating every record as changed, the rate limiter failing open, and
//! delivery falling back to the offline queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::kv::{SharedStore, StoreError, StoreResult};

/// Wraps an inner store and, when tripped, fails every operation with
/// [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct FaultyStore<S> {
    inner: Arc<S>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl<S: SharedStore> FaultyStore<S> {
    /// Wrap `inner`, initially healthy.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Flip the store between failing and healthy.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total operations attempted, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> StoreResult<()> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected fault".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: SharedStore> SharedStore for FaultyStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.gate()?;
        self.inner.mget(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.gate()?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.gate()?;
        self.inner.expire(key, ttl).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.gate()?;
        self.inner.smembers(key).await
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.gate()?;
        self.inner.scard(key).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.gate()?;
        self.inner.zadd(key, score, member).await
    }

    async fn zremrangebyscore(&self, key: &str, max: f64) -> StoreResult<usize> {
        self.gate()?;
        self.inner.zremrangebyscore(key, max).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.gate()?;
        self.inner.zcard(key).await
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<usize> {
        self.gate()?;
        self.inner.lpush_trim(key, value, cap).await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.gate()?;
        self.inner.rpop(key).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.gate()?;
        self.inner.rpush(key, value).await
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        self.gate()?;
        self.inner.llen(key).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.gate()?;
        self.inner.ping().await
    }
}
