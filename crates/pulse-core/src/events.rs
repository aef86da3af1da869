//! The [`Event`] wire envelope and queue message shapes.
//!
//! Events are the canonical output of the pipeline: created once by the
//! event generator, read-only downstream. The envelope carries base fields
//! at the top level, routing metadata under `metadata`, and a typed payload
//! under `data` whose shape is fixed by `eventType` — downstream components
//! trust the tag and never re-validate shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::ChangeCategory;

/// Envelope schema version.
pub const EVENT_VERSION: &str = "1.0";

/// Event kind discriminator; fixes the shape of [`Event::data`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Numeric series moved past a significance threshold.
    ValueUpdate,
    /// Metadata-only change.
    StructuralUpdate,
}

impl EventKind {
    /// Kebab-case wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ValueUpdate => "value-update",
            EventKind::StructuralUpdate => "structural-update",
        }
    }
}

/// Routing and quality metadata attached to every event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Groups events about the same entity within a coarse time bucket.
    pub correlation_id: String,
    /// Data-quality score in `[0.5, 1.0]`.
    pub confidence: f64,
    /// Milliseconds from batch start to event creation.
    pub processing_time_ms: u64,
    /// Delivery retry count; 0 at creation.
    pub retry_count: u32,
    /// Routing tags: category, entity id, and magnitude markers.
    /// `large-change`/`extreme-change` are the sole priority signal used
    /// by the distributor for durable-queue fan-out.
    pub tags: Vec<String>,
}

impl EventMetadata {
    /// Whether the tag set contains `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Payload for a [`EventKind::ValueUpdate`] event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueUpdatePayload {
    /// Entity identifier (`aave`, `ethereum`).
    pub entity_id: String,
    /// Full entity key (`tvl:aave`).
    pub entity_key: String,
    /// Change category.
    pub category: ChangeCategory,
    /// Previous cached value.
    pub previous_value: f64,
    /// Current value.
    pub current_value: f64,
    /// Percent change.
    pub change_percent: f64,
    /// Absolute change.
    pub change_absolute: f64,
    /// Denormalized display name, best-effort enriched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Denormalized symbol, best-effort enriched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// One changed field in a structural update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Value before the change.
    pub previous_value: Value,
    /// Value after the change.
    pub current_value: Value,
}

/// Payload for a [`EventKind::StructuralUpdate`] event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralUpdatePayload {
    /// Entity identifier.
    pub entity_id: String,
    /// Full entity key.
    pub entity_key: String,
    /// Changed fields.
    pub changes: Vec<FieldChange>,
}

/// Typed event payload; the envelope's `eventType` is the discriminator.
///
/// Serialized untagged: the two variants have disjoint required fields
/// (`currentValue` vs `changes`), so deserialization is unambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Numeric series update.
    ValueUpdate(ValueUpdatePayload),
    /// Metadata change.
    StructuralUpdate(StructuralUpdatePayload),
}

/// Canonical event envelope.
///
/// INVARIANT: `event_id` is globally unique and fresh per generation;
/// `correlation_id` is deterministic per entity/time-bucket. Idempotency
/// is tracked against the originating record, not the event id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event ID (UUID v4).
    pub event_id: String,
    /// Event kind; fixes the payload shape.
    pub event_type: EventKind,
    /// Creation time, epoch millis.
    pub timestamp: i64,
    /// Producing feed identifier.
    pub source: String,
    /// Envelope schema version.
    pub version: String,
    /// Routing and quality metadata.
    pub metadata: EventMetadata,
    /// Typed payload.
    pub data: EventPayload,
}

impl Event {
    /// Entity identifier carried in the payload.
    pub fn entity_id(&self) -> &str {
        match &self.data {
            EventPayload::ValueUpdate(p) => &p.entity_id,
            EventPayload::StructuralUpdate(p) => &p.entity_id,
        }
    }

    /// Change category of the payload.
    pub fn category(&self) -> ChangeCategory {
        match &self.data {
            EventPayload::ValueUpdate(p) => p.category,
            EventPayload::StructuralUpdate(_) => ChangeCategory::Structural,
        }
    }

    /// Primary numeric value, when the payload carries one.
    pub fn numeric_value(&self) -> Option<f64> {
        match &self.data {
            EventPayload::ValueUpdate(p) => Some(p.current_value),
            EventPayload::StructuralUpdate(_) => None,
        }
    }

    /// Whether the routing tags contain `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.has_tag(tag)
    }
}

/// Priority assigned to durable-queue messages.
///
/// The queue is reserved for actionable events: `high` for
/// `extreme-change`, `medium` for `large-change`; anything else is not
/// queued at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    /// Tagged `extreme-change`.
    High,
    /// Tagged `large-change`.
    Medium,
}

/// Message placed on the durable priority queue for the alert consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// The event.
    pub event: Event,
    /// Queue priority.
    pub priority: QueuePriority,
    /// Delivery attempts so far.
    pub retry_count: u32,
    /// Enqueue time, epoch millis.
    pub timestamp: i64,
}

/// Error details attached to dead-letter messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Human-readable message.
    pub message: String,
    /// Optional underlying detail (chain of causes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Message routed to the dead-letter queue after retry exhaustion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// The event that could not be delivered.
    pub event: Event,
    /// The original error.
    pub error: ErrorInfo,
    /// Dead-letter time, epoch millis.
    pub timestamp: i64,
}
