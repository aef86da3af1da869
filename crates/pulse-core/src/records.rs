//! Raw change-feed records and detected changes.
//!
//! [`RawRecord`] is the input shape produced by the external change feed
//! (TVL, price, and protocol-metadata rows). [`DetectedChange`] is the
//! immutable output of the change detector, consumed exactly once by the
//! event generator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a change, derived from the entity key shape.
///
/// `value-metric` and `identity-metric` are trackable numeric series and
/// pass through per-category significance thresholds; `structural` changes
/// are metadata-only and always significant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeCategory {
    /// Trackable numeric series (TVL, price).
    ValueMetric,
    /// Numeric series tied to an on-chain identity (address-keyed).
    IdentityMetric,
    /// Metadata-only change; always significant.
    Structural,
}

impl ChangeCategory {
    /// Kebab-case wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeCategory::ValueMetric => "value-metric",
            ChangeCategory::IdentityMetric => "identity-metric",
            ChangeCategory::Structural => "structural",
        }
    }

    /// Whether records of this category carry a required numeric value.
    pub fn is_numeric(self) -> bool {
        !matches!(self, ChangeCategory::Structural)
    }
}

/// A raw record from the external change feed.
///
/// Not owned by this core: arrives in batches from the feed. Records that
/// fail [`RawRecord::is_valid`] are rejected at the boundary and reported
/// in the batch summary, never silently dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Entity key in `prefix:value` form (e.g. `tvl:aave`, `price:ethereum`).
    pub key: String,
    /// Monotonic sequence number from the feed (seconds-resolution).
    pub sequence: i64,
    /// Producing feed identifier.
    pub source: String,
    /// Numeric value for value/identity-metric records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_value: Option<f64>,
    /// Opaque denormalized attributes (name, symbol, chain, ...).
    #[serde(default)]
    pub attributes: Value,
}

impl RawRecord {
    /// Whether the record carries the fields the detector requires.
    ///
    /// A record needs a non-empty key and source and a positive sequence;
    /// numeric categories additionally need a finite numeric value.
    pub fn is_valid(&self, category: ChangeCategory) -> bool {
        if self.key.is_empty() || self.source.is_empty() || self.sequence <= 0 {
            return false;
        }
        if category.is_numeric() {
            return self.numeric_value.is_some_and(f64::is_finite);
        }
        true
    }

    /// String attribute lookup (`name`, `symbol`, `chain`, ...).
    pub fn attribute_str(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).and_then(Value::as_str)
    }
}

/// A significant change detected from one raw record.
///
/// Immutable once created; consumed once by the event generator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedChange {
    /// Change category derived from the entity key.
    pub category: ChangeCategory,
    /// Full entity key (`tvl:aave`).
    pub entity_key: String,
    /// Entity identifier with the key prefix stripped (`aave`).
    pub entity_id: String,
    /// Last known value from the shared state cache (0 when no prior value).
    pub old_value: f64,
    /// Value carried by the raw record.
    pub new_value: f64,
    /// `(new - old) / old * 100`; 0→N is +100, N→0 is −100.
    pub change_percent: f64,
    /// `new - old`.
    pub change_absolute: f64,
    /// Sequence of the raw record that produced this change.
    pub sequence: i64,
    /// Producing feed identifier, carried through to the event.
    pub source: String,
    /// Attributes carried from the raw record.
    pub attributes: Value,
    /// Attributes of the previously cached record; `Null` on first
    /// observation. Used to derive field-level structural diffs.
    #[serde(default)]
    pub previous_attributes: Value,
}

impl DetectedChange {
    /// String attribute lookup on the carried raw attributes.
    pub fn attribute_str(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str, value: Option<f64>) -> RawRecord {
        RawRecord {
            key: key.into(),
            sequence: 1_700_000,
            source: "feed".into(),
            numeric_value: value,
            attributes: json!({"name": "Aave", "chain": "ethereum"}),
        }
    }

    #[test]
    fn category_wire_names_are_kebab_case() {
        assert_eq!(
            serde_json::to_value(ChangeCategory::ValueMetric).unwrap(),
            json!("value-metric")
        );
        assert_eq!(
            serde_json::to_value(ChangeCategory::IdentityMetric).unwrap(),
            json!("identity-metric")
        );
        assert_eq!(
            serde_json::to_value(ChangeCategory::Structural).unwrap(),
            json!("structural")
        );
    }

    #[test]
    fn numeric_record_requires_value() {
        let r = record("tvl:aave", None);
        assert!(!r.is_valid(ChangeCategory::ValueMetric));
        let r = record("tvl:aave", Some(1_000.0));
        assert!(r.is_valid(ChangeCategory::ValueMetric));
    }

    #[test]
    fn non_finite_value_is_invalid() {
        let r = record("tvl:aave", Some(f64::NAN));
        assert!(!r.is_valid(ChangeCategory::ValueMetric));
    }

    #[test]
    fn structural_record_needs_no_value() {
        let r = record("meta:aave", None);
        assert!(r.is_valid(ChangeCategory::Structural));
    }

    #[test]
    fn missing_identity_fields_are_invalid() {
        let mut r = record("tvl:aave", Some(1.0));
        r.key = String::new();
        assert!(!r.is_valid(ChangeCategory::ValueMetric));

        let mut r = record("tvl:aave", Some(1.0));
        r.source = String::new();
        assert!(!r.is_valid(ChangeCategory::ValueMetric));

        let mut r = record("meta:aave", None);
        r.sequence = 0;
        assert!(!r.is_valid(ChangeCategory::Structural));
    }

    #[test]
    fn attribute_lookup() {
        let r = record("tvl:aave", Some(1.0));
        assert_eq!(r.attribute_str("name"), Some("Aave"));
        assert_eq!(r.attribute_str("symbol"), None);
    }
}
