//! Event generator: wraps detected changes in the canonical envelope.
//!
//! Each change becomes exactly one [`Event`] carrying a fresh UUID, a
//! deterministic correlation id (entity key + coarse sequence bucket), a
//! data-quality confidence score, and routing tags. Display metadata is
//! enriched best-effort: a lookup failure degrades confidence, never the
//! event.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use pulse_core::errors::{PulseError, Result};
use pulse_core::events::{
    EVENT_VERSION, Event, EventKind, EventMetadata, EventPayload, FieldChange,
    StructuralUpdatePayload, ValueUpdatePayload,
};
use pulse_core::records::{ChangeCategory, DetectedChange};
use pulse_core::time::now_millis;

/// Correlation bucket width: sequences within the same hour-scale bucket
/// for one entity share a correlation id.
const CORRELATION_BUCKET: i64 = 3_600;

/// Magnitude tag threshold for `large-change` (absolute percent).
const LARGE_CHANGE_PCT: f64 = 10.0;
/// Magnitude tag threshold for `extreme-change` (absolute percent).
const EXTREME_CHANGE_PCT: f64 = 50.0;

/// Deterministic correlation id for an entity/sequence pair.
pub fn correlation_id(entity_key: &str, sequence: i64) -> String {
    format!("{entity_key}-{}", sequence / CORRELATION_BUCKET)
}

/// Display metadata resolved for an entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayMetadata {
    /// Human-readable name.
    pub name: Option<String>,
    /// Ticker symbol.
    pub symbol: Option<String>,
}

/// Best-effort lookup of display metadata for entities whose records do
/// not carry it denormalized.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Resolve display metadata; `None` when the entity is unknown or the
    /// backing source is unavailable.
    async fn display_metadata(&self, entity_id: &str) -> Option<DisplayMetadata>;
}

/// Generates events from detected changes.
#[derive(Default)]
pub struct EventGenerator {
    metadata: Option<Arc<dyn MetadataSource>>,
}

impl EventGenerator {
    /// Generator without an external metadata source: enrichment uses only
    /// record attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a metadata source consulted when record attributes lack
    /// display fields.
    pub fn with_metadata_source(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            metadata: Some(source),
        }
    }

    /// Generate the event for one detected change.
    ///
    /// `batch_started` anchors `processingTimeMs` to the start of the batch
    /// the change arrived in.
    pub async fn generate(&self, change: &DetectedChange, batch_started: Instant) -> Result<Event> {
        if change.entity_key.is_empty() || change.entity_id.is_empty() {
            return Err(PulseError::Validation(
                "detected change missing entity identity".into(),
            ));
        }
        if change.category.is_numeric() && !change.new_value.is_finite() {
            return Err(PulseError::Validation(format!(
                "non-finite value for {}",
                change.entity_key
            )));
        }

        let display = self.resolve_display(change).await;
        let confidence = confidence(change, &display);
        let tags = tags(change);

        let (event_type, data) = match change.category {
            ChangeCategory::Structural => {
                let changes = field_changes(&change.previous_attributes, &change.attributes);
                if changes.is_empty() {
                    return Err(PulseError::Validation(format!(
                        "structural change for {} has no differing fields",
                        change.entity_key
                    )));
                }
                (
                    EventKind::StructuralUpdate,
                    EventPayload::StructuralUpdate(StructuralUpdatePayload {
                        entity_id: change.entity_id.clone(),
                        entity_key: change.entity_key.clone(),
                        changes,
                    }),
                )
            }
            ChangeCategory::ValueMetric | ChangeCategory::IdentityMetric => (
                EventKind::ValueUpdate,
                EventPayload::ValueUpdate(ValueUpdatePayload {
                    entity_id: change.entity_id.clone(),
                    entity_key: change.entity_key.clone(),
                    category: change.category,
                    previous_value: change.old_value,
                    current_value: change.new_value,
                    change_percent: change.change_percent,
                    change_absolute: change.change_absolute,
                    display_name: display.name,
                    symbol: display.symbol,
                }),
            ),
        };

        Ok(Event {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: now_millis(),
            source: change.source.clone(),
            version: EVENT_VERSION.into(),
            metadata: EventMetadata {
                correlation_id: correlation_id(&change.entity_key, change.sequence),
                confidence,
                processing_time_ms: batch_started.elapsed().as_millis() as u64,
                retry_count: 0,
                tags,
            },
            data,
        })
    }

    async fn resolve_display(&self, change: &DetectedChange) -> DisplayMetadata {
        let mut display = DisplayMetadata {
            name: change.attribute_str("name").map(str::to_owned),
            symbol: change.attribute_str("symbol").map(str::to_owned),
        };
        if display.name.is_some() && display.symbol.is_some() {
            return display;
        }
        if let Some(source) = &self.metadata
            && let Some(looked_up) = source.display_metadata(&change.entity_id).await
        {
            display.name = display.name.or(looked_up.name);
            display.symbol = display.symbol.or(looked_up.symbol);
        }
        display
    }
}

/// Data-quality confidence in `[0.5, 1.0]`.
///
/// Starts at 0.9; extreme moves and missing display metadata each shave
/// confidence, clamped to the documented range. The magnitude penalties
/// stack: a move past 100% pays both the >50 and the >100 penalty.
pub fn confidence(change: &DetectedChange, display: &DisplayMetadata) -> f64 {
    let mut score: f64 = 0.9;
    let pct = change.change_percent.abs();
    if pct > 50.0 {
        score -= 0.1;
    }
    if pct > 100.0 {
        score -= 0.2;
    }
    if display.name.is_none() {
        score -= 0.05;
    }
    if display.symbol.is_none() {
        score -= 0.05;
    }
    score.clamp(0.5, 1.0)
}

/// Routing tags: category, entity id, chain (when the record carries
/// one), and magnitude markers.
pub fn tags(change: &DetectedChange) -> Vec<String> {
    let mut tags = Vec::with_capacity(4);
    push_unique(&mut tags, change.category.as_str().to_owned());
    push_unique(&mut tags, change.entity_id.clone());
    if let Some(chain) = change.attribute_str("chain") {
        push_unique(&mut tags, chain.to_owned());
    }
    let pct = change.change_percent.abs();
    if pct >= LARGE_CHANGE_PCT {
        push_unique(&mut tags, "large-change".into());
    }
    if pct >= EXTREME_CHANGE_PCT {
        push_unique(&mut tags, "extreme-change".into());
    }
    tags
}

fn push_unique(tags: &mut Vec<String>, tag: String) {
    if !tags.iter().any(|t| *t == tag) {
        tags.push(tag);
    }
}

/// Field-level diff between two attribute objects, sorted by field name.
///
/// Non-object attribute values are treated as empty objects, so a first
/// observation (`Null` previous) lists every current field as added.
fn field_changes(previous: &Value, current: &Value) -> Vec<FieldChange> {
    let prev_map: Map<String, Value> = previous.as_object().cloned().unwrap_or_default();
    let curr_map: Map<String, Value> = current.as_object().cloned().unwrap_or_default();

    let mut fields: Vec<&String> = prev_map.keys().chain(curr_map.keys()).collect();
    fields.sort();
    fields.dedup();

    fields
        .into_iter()
        .filter_map(|field| {
            let before = prev_map.get(field).cloned().unwrap_or(Value::Null);
            let after = curr_map.get(field).cloned().unwrap_or(Value::Null);
            (before != after).then(|| FieldChange {
                field: field.clone(),
                previous_value: before,
                current_value: after,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(pct: f64, attrs: Value) -> DetectedChange {
        DetectedChange {
            category: ChangeCategory::ValueMetric,
            entity_key: "price:ethereum".into(),
            entity_id: "ethereum".into(),
            old_value: 2_500.0,
            new_value: 2_500.0 * (1.0 + pct / 100.0),
            change_percent: pct,
            change_absolute: 2_500.0 * pct / 100.0,
            sequence: 1_700_000,
            source: "feed".into(),
            attributes: attrs,
            previous_attributes: Value::Null,
        }
    }

    fn full_attrs() -> Value {
        json!({"name": "Ethereum", "symbol": "ETH"})
    }

    #[test]
    fn correlation_id_buckets_by_hour_scale() {
        assert_eq!(correlation_id("price:ethereum", 7_200), "price:ethereum-2");
        assert_eq!(correlation_id("price:ethereum", 7_199), "price:ethereum-1");
        // Same bucket, same id.
        assert_eq!(
            correlation_id("price:ethereum", 3_700),
            correlation_id("price:ethereum", 3_800)
        );
    }

    #[test]
    fn confidence_penalties() {
        let full = DisplayMetadata {
            name: Some("Ethereum".into()),
            symbol: Some("ETH".into()),
        };
        let bare = DisplayMetadata::default();
        assert!((confidence(&change(10.0, full_attrs()), &full) - 0.9).abs() < 1e-9);
        // Strictly-greater boundaries.
        assert!((confidence(&change(50.0, full_attrs()), &full) - 0.9).abs() < 1e-9);
        assert!((confidence(&change(50.1, full_attrs()), &full) - 0.8).abs() < 1e-9);
        assert!((confidence(&change(100.0, full_attrs()), &full) - 0.8).abs() < 1e-9);
        // Past 100% both magnitude penalties apply.
        assert!((confidence(&change(100.1, full_attrs()), &full) - 0.6).abs() < 1e-9);
        assert!((confidence(&change(150.0, full_attrs()), &full) - 0.6).abs() < 1e-9);
        assert!((confidence(&change(-150.0, full_attrs()), &full) - 0.6).abs() < 1e-9);
        // Missing display metadata: 0.05 each.
        assert!((confidence(&change(10.0, json!({})), &bare) - 0.8).abs() < 1e-9);
        // Floor at 0.5.
        assert!(confidence(&change(500.0, json!({})), &bare) >= 0.5);
    }

    #[test]
    fn magnitude_tags_at_boundaries() {
        let t = tags(&change(9.9, full_attrs()));
        assert_eq!(t, vec!["value-metric", "ethereum"]);
        let t = tags(&change(10.0, full_attrs()));
        assert!(t.contains(&"large-change".to_string()));
        assert!(!t.contains(&"extreme-change".to_string()));
        let t = tags(&change(-60.0, full_attrs()));
        assert!(t.contains(&"large-change".to_string()));
        assert!(t.contains(&"extreme-change".to_string()));
    }

    #[test]
    fn chain_attribute_becomes_a_tag() {
        let t = tags(&change(5.0, json!({"chain": "arbitrum"})));
        assert!(t.contains(&"arbitrum".to_string()));
    }

    #[tokio::test]
    async fn non_finite_value_is_rejected() {
        let generator = EventGenerator::new();
        let mut c = change(10.0, full_attrs());
        c.new_value = f64::NAN;
        let err = generator.generate(&c, Instant::now()).await.unwrap_err();
        assert!(matches!(err, PulseError::Validation(_)));
    }

    #[tokio::test]
    async fn generates_value_update_envelope() {
        let generator = EventGenerator::new();
        let ev = generator
            .generate(&change(10.0, full_attrs()), Instant::now())
            .await
            .unwrap();
        assert_eq!(ev.event_type, EventKind::ValueUpdate);
        assert_eq!(ev.version, EVENT_VERSION);
        assert_eq!(ev.metadata.retry_count, 0);
        assert_eq!(ev.metadata.correlation_id, "price:ethereum-472");
        let EventPayload::ValueUpdate(p) = &ev.data else {
            panic!("expected value-update payload");
        };
        assert_eq!(p.display_name.as_deref(), Some("Ethereum"));
        assert_eq!(p.symbol.as_deref(), Some("ETH"));
        assert!((p.current_value - 2_750.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn event_ids_are_unique() {
        let generator = EventGenerator::new();
        let c = change(10.0, full_attrs());
        let a = generator.generate(&c, Instant::now()).await.unwrap();
        let b = generator.generate(&c, Instant::now()).await.unwrap();
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.metadata.correlation_id, b.metadata.correlation_id);
    }

    struct StubMetadata;

    #[async_trait]
    impl MetadataSource for StubMetadata {
        async fn display_metadata(&self, entity_id: &str) -> Option<DisplayMetadata> {
            (entity_id == "ethereum").then(|| DisplayMetadata {
                name: Some("Ethereum".into()),
                symbol: Some("ETH".into()),
            })
        }
    }

    #[tokio::test]
    async fn enrichment_falls_back_to_metadata_source() {
        let generator = EventGenerator::with_metadata_source(Arc::new(StubMetadata));
        let ev = generator
            .generate(&change(10.0, json!({})), Instant::now())
            .await
            .unwrap();
        let EventPayload::ValueUpdate(p) = &ev.data else {
            panic!("expected value-update payload");
        };
        assert_eq!(p.display_name.as_deref(), Some("Ethereum"));
        // Fully enriched: no confidence penalty.
        assert!((ev.metadata.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn enrichment_miss_degrades_confidence_not_the_event() {
        let generator = EventGenerator::with_metadata_source(Arc::new(StubMetadata));
        let mut c = change(10.0, json!({}));
        c.entity_key = "price:unknowncoin".into();
        c.entity_id = "unknowncoin".into();
        let ev = generator.generate(&c, Instant::now()).await.unwrap();
        assert!((ev.metadata.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn structural_event_lists_field_diffs() {
        let generator = EventGenerator::new();
        let c = DetectedChange {
            category: ChangeCategory::Structural,
            entity_key: "meta:aave".into(),
            entity_id: "aave".into(),
            old_value: 0.0,
            new_value: 0.0,
            change_percent: 0.0,
            change_absolute: 0.0,
            sequence: 1_700_000,
            source: "feed".into(),
            attributes: json!({"version": "v3", "chain": "ethereum"}),
            previous_attributes: json!({"version": "v2", "chain": "ethereum"}),
        };
        let ev = generator.generate(&c, Instant::now()).await.unwrap();
        assert_eq!(ev.event_type, EventKind::StructuralUpdate);
        let EventPayload::StructuralUpdate(p) = &ev.data else {
            panic!("expected structural payload");
        };
        assert_eq!(p.changes.len(), 1);
        assert_eq!(p.changes[0].field, "version");
        assert_eq!(p.changes[0].previous_value, json!("v2"));
        assert_eq!(p.changes[0].current_value, json!("v3"));
    }

    #[tokio::test]
    async fn first_structural_observation_lists_all_fields_as_added() {
        let generator = EventGenerator::new();
        let c = DetectedChange {
            category: ChangeCategory::Structural,
            entity_key: "meta:aave".into(),
            entity_id: "aave".into(),
            old_value: 0.0,
            new_value: 0.0,
            change_percent: 0.0,
            change_absolute: 0.0,
            sequence: 1_700_000,
            source: "feed".into(),
            attributes: json!({"version": "v2"}),
            previous_attributes: Value::Null,
        };
        let ev = generator.generate(&c, Instant::now()).await.unwrap();
        let EventPayload::StructuralUpdate(p) = &ev.data else {
            panic!("expected structural payload");
        };
        assert_eq!(p.changes.len(), 1);
        assert_eq!(p.changes[0].previous_value, Value::Null);
    }
}
