//! Broker topic naming and validation.
//!
//! Topic grammar (subscriber-facing):
//!
//! - `events:value-update`, `events:structural-update` — kind-level topics
//! - `events:entity:<id>` — entity-scoped
//! - `events:category:<name>` — category-scoped

use std::sync::LazyLock;

use regex::Regex;

use crate::events::EventKind;
use crate::records::ChangeCategory;

static TOPIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^events:(value-update|structural-update|entity:.+|category:.+)$")
        .expect("topic pattern is valid")
});

/// Kind-level topic for an event kind.
pub fn kind_topic(kind: EventKind) -> String {
    format!("events:{}", kind.as_str())
}

/// Entity-scoped topic.
pub fn entity_topic(entity_id: &str) -> String {
    format!("events:entity:{entity_id}")
}

/// Category-scoped topic.
pub fn category_topic(category: ChangeCategory) -> String {
    format!("events:category:{}", category.as_str())
}

/// Whether a subscriber-supplied topic string is allow-listed.
pub fn is_valid_topic(topic: &str) -> bool {
    TOPIC_RE.is_match(topic)
}
