//! State cache: previous-value lookup, idempotency markers, and the
//! per-source watermark.
//!
//! Every read is bounded by the store op timeout and degrades instead of
//! failing the batch: an unreachable store means every key looks like a
//! cache miss (so every record is treated as changed) and every event looks
//! new (duplicates may slip through). Writes are best-effort; a failed
//! write is logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use pulse_core::records::RawRecord;
use pulse_core::settings::CacheSettings;

use crate::kv::{SharedStore, StoreError, StoreResult};

fn cache_key(entity_key: &str) -> String {
    format!("cache:{entity_key}")
}

fn dedup_key(processing_id: &str) -> String {
    format!("event:{processing_id}")
}

fn watermark_key(source: &str) -> String {
    format!("events:last-processed:{source}")
}

/// Previous-value and dedup index over the shared store.
pub struct StateCache {
    store: Arc<dyn SharedStore>,
    settings: CacheSettings,
    op_timeout: Duration,
}

impl StateCache {
    /// Build a cache over `store`.
    pub fn new(store: Arc<dyn SharedStore>, settings: CacheSettings, op_timeout: Duration) -> Self {
        Self {
            store,
            settings,
            op_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    /// Look up the previously cached records for `entity_keys`.
    ///
    /// Missing, expired, and unparsable entries are absent from the result.
    /// A store failure returns an empty map: downstream treats every key as
    /// a first observation rather than dropping the batch.
    pub async fn previous_records(&self, entity_keys: &[String]) -> HashMap<String, RawRecord> {
        if entity_keys.is_empty() {
            return HashMap::new();
        }
        let store_keys: Vec<String> = entity_keys.iter().map(|k| cache_key(k)).collect();
        let values = match self.bounded(self.store.mget(&store_keys)).await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, keys = entity_keys.len(), "previous-value lookup failed, treating all as misses");
                return HashMap::new();
            }
        };
        let mut out = HashMap::with_capacity(entity_keys.len());
        for (entity_key, value) in entity_keys.iter().zip(values) {
            let Some(raw) = value else { continue };
            match serde_json::from_str::<RawRecord>(&raw) {
                Ok(record) => {
                    let _ = out.insert(entity_key.clone(), record);
                }
                Err(e) => {
                    warn!(key = %entity_key, error = %e, "cached record unparsable, treating as miss");
                }
            }
        }
        out
    }

    /// Cache `record` as the new previous value for its key. Best-effort.
    pub async fn record_value(&self, record: &RawRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %record.key, error = %e, "record not serializable, skipping cache write");
                return;
            }
        };
        let ttl = Duration::from_secs(self.settings.previous_value_ttl_secs);
        if let Err(e) = self
            .bounded(self.store.set(&cache_key(&record.key), &raw, Some(ttl)))
            .await
        {
            warn!(key = %record.key, error = %e, "cache write failed");
        }
    }

    /// Cache a batch of records. Best-effort, per record.
    pub async fn record_values(&self, records: &[RawRecord]) {
        for record in records {
            self.record_value(record).await;
        }
    }

    /// Whether a processing id has already been handled.
    ///
    /// A store failure reads as "not a duplicate": re-delivery is preferred
    /// over dropping events when the dedup index is unreachable.
    pub async fn is_duplicate(&self, processing_id: &str) -> bool {
        match self.bounded(self.store.exists(&dedup_key(processing_id))).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(processing_id, error = %e, "dedup lookup failed, assuming not duplicate");
                false
            }
        }
    }

    /// Mark a processing id as handled for the dedup TTL. Best-effort.
    pub async fn mark_processed(&self, processing_id: &str) {
        let ttl = Duration::from_secs(self.settings.dedup_ttl_secs);
        if let Err(e) = self
            .bounded(self.store.set(&dedup_key(processing_id), "1", Some(ttl)))
            .await
        {
            warn!(processing_id, error = %e, "dedup mark failed");
        }
    }

    /// Highest sequence processed for `source`, if recorded.
    pub async fn last_processed(&self, source: &str) -> Option<i64> {
        match self.bounded(self.store.get(&watermark_key(source))).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                debug!(source, error = %e, "watermark lookup failed");
                None
            }
        }
    }

    /// Advance the per-source watermark. Best-effort; never moves backward.
    pub async fn set_last_processed(&self, source: &str, sequence: i64) {
        if let Some(prev) = self.last_processed(source).await
            && prev >= sequence
        {
            return;
        }
        if let Err(e) = self
            .bounded(
                self.store
                    .set(&watermark_key(source), &sequence.to_string(), None),
            )
            .await
        {
            warn!(source, sequence, error = %e, "watermark write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faulty::FaultyStore;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn record(key: &str, seq: i64, value: f64) -> RawRecord {
        RawRecord {
            key: key.into(),
            sequence: seq,
            source: "unit".into(),
            numeric_value: Some(value),
            attributes: json!({}),
        }
    }

    fn cache_over(store: Arc<dyn SharedStore>) -> StateCache {
        StateCache::new(store, CacheSettings::default(), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn roundtrips_previous_records() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        cache.record_value(&record("tvl:uniswap", 7, 1_000.0)).await;
        let prev = cache
            .previous_records(&["tvl:uniswap".into(), "tvl:aave".into()])
            .await;
        assert_eq!(prev.len(), 1);
        assert_eq!(prev["tvl:uniswap"].numeric_value, Some(1_000.0));
    }

    #[tokio::test]
    async fn store_outage_reads_as_all_misses() {
        let inner = Arc::new(MemoryStore::new());
        let faulty = Arc::new(FaultyStore::new(Arc::clone(&inner)));
        let cache = cache_over(Arc::clone(&faulty) as Arc<dyn SharedStore>);
        cache.record_value(&record("tvl:uniswap", 1, 5.0)).await;
        faulty.set_failing(true);
        let prev = cache.previous_records(&["tvl:uniswap".into()]).await;
        assert!(prev.is_empty());
    }

    #[tokio::test]
    async fn dedup_marks_and_detects() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        assert!(!cache.is_duplicate("evt-1").await);
        cache.mark_processed("evt-1").await;
        assert!(cache.is_duplicate("evt-1").await);
        assert!(!cache.is_duplicate("evt-2").await);
    }

    #[tokio::test]
    async fn dedup_fails_open() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        faulty.set_failing(true);
        let cache = cache_over(Arc::clone(&faulty) as Arc<dyn SharedStore>);
        assert!(!cache.is_duplicate("evt-1").await);
    }

    #[tokio::test]
    async fn watermark_never_moves_backward() {
        let cache = cache_over(Arc::new(MemoryStore::new()));
        assert_eq!(cache.last_processed("chain").await, None);
        cache.set_last_processed("chain", 10).await;
        cache.set_last_processed("chain", 5).await;
        assert_eq!(cache.last_processed("chain").await, Some(10));
        cache.set_last_processed("chain", 12).await;
        assert_eq!(cache.last_processed("chain").await, Some(12));
    }

    #[tokio::test]
    async fn unparsable_cache_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set("cache:tvl:x", "not json", None).await.unwrap();
        let cache = cache_over(store);
        let prev = cache.previous_records(&["tvl:x".into()]).await;
        assert!(prev.is_empty());
    }
}
