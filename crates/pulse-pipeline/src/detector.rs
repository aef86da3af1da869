//! Change detector: the pipeline's entry stage.
//!
//! Consumes raw change-feed batches, rejects malformed records, collapses
//! per-key duplicates to the highest sequence, compares the survivors
//! against the shared state cache, and emits a [`DetectedChange`] for each
//! record that crosses its category's significance threshold. Structural
//! records bypass thresholds: any attribute difference is significant.
//!
//! The detector is resilient to cache unavailability: when previous values
//! cannot be read, every record is treated as a first observation rather
//! than stalling the batch.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use pulse_core::records::{ChangeCategory, DetectedChange, RawRecord};
use pulse_core::settings::{CategoryThreshold, ThresholdSettings};
use pulse_store::StateCache;

/// Derive the change category from the entity key shape.
///
/// `tvl:` and `price:` prefixes are trackable value series; keys carrying
/// an address segment (`:0x`) are identity-keyed series; everything else
/// is structural metadata.
pub fn classify(key: &str) -> ChangeCategory {
    if key.starts_with("tvl:") || key.starts_with("price:") {
        ChangeCategory::ValueMetric
    } else if key.contains(":0x") {
        ChangeCategory::IdentityMetric
    } else {
        ChangeCategory::Structural
    }
}

/// Entity identifier: the key with its first prefix segment stripped.
pub fn entity_id(key: &str) -> &str {
    key.split_once(':').map_or(key, |(_, rest)| rest)
}

/// Percent change from `old` to `new`.
///
/// A first observation (`old == 0`) of a nonzero value reads as +100; a
/// drop to zero falls out of the formula as −100.
pub fn change_percent(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 { 0.0 } else { 100.0 }
    } else {
        (new - old) / old * 100.0
    }
}

/// Per-batch detection counters, suitable for the stats surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    /// Records in the incoming batch.
    pub received: usize,
    /// Records rejected at validation.
    pub invalid: usize,
    /// Records collapsed by in-batch key dedup.
    pub duplicates: usize,
    /// Records older than the cached value for their key.
    pub stale: usize,
    /// Records below their category threshold (or structurally identical).
    pub unchanged: usize,
    /// Significant changes emitted.
    pub detected: usize,
    /// Detected changes in the `value-metric` category.
    pub value_metric: usize,
    /// Detected changes in the `identity-metric` category.
    pub identity_metric: usize,
    /// Detected changes in the `structural` category.
    pub structural: usize,
    /// Largest |percent change| among detected numeric changes.
    pub max_change_percent: f64,
    /// Mean |percent change| among detected numeric changes.
    pub avg_change_percent: f64,
}

/// Output of one detection pass.
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    /// Significant changes, in first-occurrence key order.
    pub changes: Vec<DetectedChange>,
    /// Batch counters.
    pub summary: ChangeSummary,
}

/// Stateless detector over the shared state cache.
pub struct ChangeDetector {
    cache: std::sync::Arc<StateCache>,
    thresholds: ThresholdSettings,
}

impl ChangeDetector {
    /// Build a detector over `cache` with the given thresholds.
    pub fn new(cache: std::sync::Arc<StateCache>, thresholds: ThresholdSettings) -> Self {
        Self { cache, thresholds }
    }

    fn threshold_for(&self, category: ChangeCategory) -> CategoryThreshold {
        match category {
            ChangeCategory::ValueMetric => self.thresholds.value_metric,
            ChangeCategory::IdentityMetric => self.thresholds.identity_metric,
            // Structural changes bypass thresholds entirely.
            ChangeCategory::Structural => CategoryThreshold {
                min_percent: 0.0,
                min_absolute: None,
            },
        }
    }

    /// Run one detection pass over a raw batch.
    ///
    /// Also refreshes the state cache with every valid, non-stale record so
    /// the next batch compares against the latest observation — including
    /// records whose change was below threshold.
    pub async fn detect_batch(&self, records: &[RawRecord]) -> DetectionOutcome {
        let mut summary = ChangeSummary {
            received: records.len(),
            ..ChangeSummary::default()
        };

        // Validate, then collapse per-key duplicates to the highest
        // sequence, preserving first-occurrence order.
        let mut latest: Vec<RawRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for record in records {
            let category = classify(&record.key);
            if !record.is_valid(category) {
                warn!(key = %record.key, sequence = record.sequence, "rejecting invalid record");
                summary.invalid += 1;
                continue;
            }
            match index.get(&record.key) {
                Some(&i) => {
                    summary.duplicates += 1;
                    if record.sequence > latest[i].sequence {
                        latest[i] = record.clone();
                    }
                }
                None => {
                    let _ = index.insert(record.key.clone(), latest.len());
                    latest.push(record.clone());
                }
            }
        }

        let keys: Vec<String> = latest.iter().map(|r| r.key.clone()).collect();
        let previous = self.cache.previous_records(&keys).await;

        let mut changes = Vec::new();
        let mut to_cache = Vec::new();
        for record in latest {
            let prev = previous.get(&record.key);
            if let Some(prev) = prev
                && prev.sequence >= record.sequence
            {
                summary.stale += 1;
                continue;
            }
            let category = classify(&record.key);
            if let Some(change) = self.evaluate(category, &record, prev) {
                match category {
                    ChangeCategory::ValueMetric => summary.value_metric += 1,
                    ChangeCategory::IdentityMetric => summary.identity_metric += 1,
                    ChangeCategory::Structural => summary.structural += 1,
                }
                changes.push(change);
            } else {
                summary.unchanged += 1;
            }
            to_cache.push(record);
        }
        self.cache.record_values(&to_cache).await;

        summary.detected = changes.len();
        let numeric: Vec<f64> = changes
            .iter()
            .filter(|c| c.category.is_numeric())
            .map(|c| c.change_percent.abs())
            .collect();
        if !numeric.is_empty() {
            summary.max_change_percent = numeric.iter().copied().fold(0.0, f64::max);
            summary.avg_change_percent = numeric.iter().sum::<f64>() / numeric.len() as f64;
        }
        debug!(
            received = summary.received,
            invalid = summary.invalid,
            detected = summary.detected,
            "detection pass complete"
        );
        DetectionOutcome { changes, summary }
    }

    fn evaluate(
        &self,
        category: ChangeCategory,
        record: &RawRecord,
        prev: Option<&RawRecord>,
    ) -> Option<DetectedChange> {
        let previous_attributes = prev.map_or(Value::Null, |p| p.attributes.clone());
        if category == ChangeCategory::Structural {
            // Structurally identical records are not changes; a first
            // observation always is.
            if prev.is_some_and(|p| p.attributes == record.attributes) {
                return None;
            }
            return Some(DetectedChange {
                category,
                entity_key: record.key.clone(),
                entity_id: entity_id(&record.key).to_owned(),
                old_value: 0.0,
                new_value: 0.0,
                change_percent: 0.0,
                change_absolute: 0.0,
                sequence: record.sequence,
                source: record.source.clone(),
                attributes: record.attributes.clone(),
                previous_attributes,
            });
        }

        let old_value = prev.and_then(|p| p.numeric_value).unwrap_or(0.0);
        let new_value = record.numeric_value.unwrap_or(0.0);
        let pct = change_percent(old_value, new_value);
        let abs = new_value - old_value;
        let t = self.threshold_for(category);
        let significant =
            pct.abs() >= t.min_percent || t.min_absolute.is_some_and(|m| abs.abs() >= m);
        if !significant {
            return None;
        }
        Some(DetectedChange {
            category,
            entity_key: record.key.clone(),
            entity_id: entity_id(&record.key).to_owned(),
            old_value,
            new_value,
            change_percent: pct,
            change_absolute: abs,
            sequence: record.sequence,
            source: record.source.clone(),
            attributes: record.attributes.clone(),
            previous_attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use pulse_core::settings::CacheSettings;
    use pulse_store::{FaultyStore, MemoryStore, SharedStore};

    fn detector_over(store: Arc<dyn SharedStore>) -> ChangeDetector {
        let cache = StateCache::new(store, CacheSettings::default(), Duration::from_millis(500));
        ChangeDetector::new(Arc::new(cache), ThresholdSettings::default())
    }

    fn record(key: &str, seq: i64, value: f64) -> RawRecord {
        RawRecord {
            key: key.into(),
            sequence: seq,
            source: "feed".into(),
            numeric_value: Some(value),
            attributes: json!({"name": "Ethereum", "symbol": "ETH"}),
        }
    }

    #[test]
    fn classifies_by_key_shape() {
        assert_eq!(classify("tvl:aave"), ChangeCategory::ValueMetric);
        assert_eq!(classify("price:ethereum"), ChangeCategory::ValueMetric);
        assert_eq!(
            classify("balance:0xdeadbeef"),
            ChangeCategory::IdentityMetric
        );
        assert_eq!(classify("meta:aave"), ChangeCategory::Structural);
        assert_eq!(classify("protocol"), ChangeCategory::Structural);
    }

    #[test]
    fn entity_id_strips_first_prefix() {
        assert_eq!(entity_id("tvl:aave"), "aave");
        assert_eq!(entity_id("balance:0xabc:eth"), "0xabc:eth");
        assert_eq!(entity_id("noprefix"), "noprefix");
    }

    #[test]
    fn percent_change_edges() {
        assert!((change_percent(2_500.0, 2_750.0) - 10.0).abs() < 1e-9);
        assert!((change_percent(0.0, 42.0) - 100.0).abs() < f64::EPSILON);
        assert!((change_percent(42.0, 0.0) - -100.0).abs() < f64::EPSILON);
        assert!(change_percent(0.0, 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn first_observation_is_detected() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let out = d.detect_batch(&[record("price:ethereum", 100, 2_500.0)]).await;
        assert_eq!(out.changes.len(), 1);
        let c = &out.changes[0];
        assert_eq!(c.entity_id, "ethereum");
        assert!((c.old_value - 0.0).abs() < f64::EPSILON);
        assert!((c.change_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(out.summary.value_metric, 1);
    }

    #[tokio::test]
    async fn below_threshold_change_is_unchanged() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let _ = d.detect_batch(&[record("price:ethereum", 100, 2_500.0)]).await;
        // +0.4% and +10 absolute: under both arms (1% / 10 000).
        let out = d.detect_batch(&[record("price:ethereum", 101, 2_510.0)]).await;
        assert!(out.changes.is_empty());
        assert_eq!(out.summary.unchanged, 1);
    }

    #[tokio::test]
    async fn absolute_arm_triggers_without_percent() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let _ = d
            .detect_batch(&[record("tvl:aave", 100, 10_000_000.0)])
            .await;
        // +0.2% but +20 000 absolute: absolute arm fires.
        let out = d
            .detect_batch(&[record("tvl:aave", 101, 10_020_000.0)])
            .await;
        assert_eq!(out.changes.len(), 1);
        assert!((out.changes[0].change_absolute - 20_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn in_batch_duplicates_keep_highest_sequence() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let out = d
            .detect_batch(&[
                record("price:ethereum", 100, 2_500.0),
                record("price:ethereum", 102, 2_750.0),
                record("price:ethereum", 101, 2_600.0),
            ])
            .await;
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].sequence, 102);
        assert!((out.changes[0].new_value - 2_750.0).abs() < f64::EPSILON);
        assert_eq!(out.summary.duplicates, 2);
    }

    #[tokio::test]
    async fn stale_records_are_skipped() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let _ = d.detect_batch(&[record("price:ethereum", 100, 2_500.0)]).await;
        let out = d.detect_batch(&[record("price:ethereum", 99, 9_999.0)]).await;
        assert!(out.changes.is_empty());
        assert_eq!(out.summary.stale, 1);
    }

    #[tokio::test]
    async fn invalid_records_are_counted_not_dropped_silently() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let mut bad = record("price:ethereum", 100, 2_500.0);
        bad.numeric_value = None;
        let out = d
            .detect_batch(&[bad, record("price:solana", 100, 150.0)])
            .await;
        assert_eq!(out.summary.invalid, 1);
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].entity_id, "solana");
    }

    #[tokio::test]
    async fn structural_change_diffs_attributes() {
        let d = detector_over(Arc::new(MemoryStore::new()));
        let mut first = record("meta:aave", 100, 0.0);
        first.numeric_value = None;
        first.attributes = json!({"version": "v2"});
        let _ = d.detect_batch(std::slice::from_ref(&first)).await;

        // Identical attributes: no change.
        let mut same = first.clone();
        same.sequence = 101;
        let out = d.detect_batch(&[same]).await;
        assert!(out.changes.is_empty());
        assert_eq!(out.summary.unchanged, 1);

        // Different attributes: always significant.
        let mut changed = first.clone();
        changed.sequence = 102;
        changed.attributes = json!({"version": "v3"});
        let out = d.detect_batch(&[changed]).await;
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].category, ChangeCategory::Structural);
        assert_eq!(out.changes[0].previous_attributes, json!({"version": "v2"}));
        assert_eq!(out.summary.structural, 1);
    }

    #[tokio::test]
    async fn cache_outage_treats_all_as_first_observations() {
        let inner = Arc::new(MemoryStore::new());
        let faulty = Arc::new(FaultyStore::new(Arc::clone(&inner)));
        let d = detector_over(Arc::clone(&faulty) as Arc<dyn SharedStore>);
        let _ = d.detect_batch(&[record("price:ethereum", 100, 2_500.0)]).await;
        faulty.set_failing(true);
        // Tiny change, but with the cache unreadable it reads as new.
        let out = d.detect_batch(&[record("price:ethereum", 101, 2_501.0)]).await;
        assert_eq!(out.changes.len(), 1);
        assert!((out.changes[0].change_percent - 100.0).abs() < f64::EPSILON);
    }
}
