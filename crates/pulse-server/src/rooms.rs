//! Topic rooms and per-subscriber filters.
//!
//! A room is the set of connections subscribed to one topic. Membership
//! lives in the shared store (`room:<topic>` sets plus the `rooms` index),
//! and each subscription may carry a [`SubscriptionFilter`] stored under
//! `sub:<conn>:<topic>`. Filters narrow a room, never widen it: a
//! connection only receives an event when the event's topic matches its
//! room and the event passes the connection's filter.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pulse_core::events::Event;
use pulse_core::records::ChangeCategory;
use pulse_core::topics::is_valid_topic;
use pulse_store::SharedStore;

use crate::errors::ServerError;

const ROOMS_INDEX: &str = "rooms";

fn room_key(topic: &str) -> String {
    format!("room:{topic}")
}

fn subs_key(connection_id: &str) -> String {
    format!("subs:{connection_id}")
}

fn filter_key(connection_id: &str, topic: &str) -> String {
    format!("sub:{connection_id}:{topic}")
}

/// Per-subscription narrowing filter.
///
/// Every present clause must pass. An event without a numeric value fails
/// a present value bound rather than slipping past it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionFilter {
    /// Only these entity ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    /// Only these categories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<ChangeCategory>>,
    /// Only events whose current value is at least this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    /// Only events whose current value is at most this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

impl SubscriptionFilter {
    /// Whether this filter has no clauses.
    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_none()
            && self.categories.is_none()
            && self.min_value.is_none()
            && self.max_value.is_none()
    }

    /// Whether `event` passes every present clause.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.entity_ids
            && !ids.iter().any(|id| id == event.entity_id())
        {
            return false;
        }
        if let Some(categories) = &self.categories
            && !categories.contains(&event.category())
        {
            return false;
        }
        if self.min_value.is_some() || self.max_value.is_some() {
            let Some(value) = event.numeric_value() else {
                return false;
            };
            if self.min_value.is_some_and(|min| value < min) {
                return false;
            }
            if self.max_value.is_some_and(|max| value > max) {
                return false;
            }
        }
        true
    }
}

/// Shared-store-backed room manager.
pub struct RoomManager {
    store: Arc<dyn SharedStore>,
}

impl RoomManager {
    /// Build a room manager over `store`.
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Subscribe a connection to a topic, optionally with a filter.
    ///
    /// Re-subscribing replaces the previous filter for that topic.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        topic: &str,
        filter: Option<SubscriptionFilter>,
    ) -> Result<(), ServerError> {
        if !is_valid_topic(topic) {
            return Err(ServerError::InvalidTopic(topic.to_owned()));
        }
        let _ = self.store.sadd(&room_key(topic), connection_id).await?;
        let _ = self.store.sadd(ROOMS_INDEX, topic).await?;
        let _ = self.store.sadd(&subs_key(connection_id), topic).await?;
        match filter {
            Some(filter) if !filter.is_empty() => {
                let raw = serde_json::to_string(&filter).unwrap_or_default();
                self.store
                    .set(&filter_key(connection_id, topic), &raw, None)
                    .await?;
            }
            _ => {
                let _ = self.store.del(&filter_key(connection_id, topic)).await?;
            }
        }
        debug!(connection_id, topic, "subscribed");
        Ok(())
    }

    /// Unsubscribe a connection from a topic. Idempotent.
    pub async fn unsubscribe(&self, connection_id: &str, topic: &str) -> Result<(), ServerError> {
        let _ = self.store.srem(&room_key(topic), connection_id).await?;
        let _ = self.store.srem(&subs_key(connection_id), topic).await?;
        let _ = self.store.del(&filter_key(connection_id, topic)).await?;
        // Drop empty rooms from the index so stats stay honest.
        if self.store.scard(&room_key(topic)).await? == 0 {
            let _ = self.store.srem(ROOMS_INDEX, topic).await?;
            let _ = self.store.del(&room_key(topic)).await?;
        }
        debug!(connection_id, topic, "unsubscribed");
        Ok(())
    }

    /// Remove a connection from every room it joined.
    pub async fn unsubscribe_all(&self, connection_id: &str) -> Result<(), ServerError> {
        for topic in self.store.smembers(&subs_key(connection_id)).await? {
            self.unsubscribe(connection_id, &topic).await?;
        }
        let _ = self.store.del(&subs_key(connection_id)).await?;
        Ok(())
    }

    /// Topics a connection is subscribed to.
    pub async fn subscriptions(&self, connection_id: &str) -> Result<Vec<String>, ServerError> {
        Ok(self.store.smembers(&subs_key(connection_id)).await?)
    }

    /// The stored filter for one subscription, if any.
    pub async fn filter_for(
        &self,
        connection_id: &str,
        topic: &str,
    ) -> Result<Option<SubscriptionFilter>, ServerError> {
        let Some(raw) = self.store.get(&filter_key(connection_id, topic)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(filter) => Ok(Some(filter)),
            Err(e) => {
                // Unparsable filter reads as unfiltered rather than muting
                // the subscription.
                warn!(connection_id, topic, error = %e, "unparsable filter, ignoring");
                Ok(None)
            }
        }
    }

    /// Room members whose filters pass `event`.
    pub async fn filtered_subscribers(
        &self,
        topic: &str,
        event: &Event,
    ) -> Result<Vec<String>, ServerError> {
        let mut out = Vec::new();
        for connection_id in self.store.smembers(&room_key(topic)).await? {
            let passes = match self.filter_for(&connection_id, topic).await? {
                Some(filter) => filter.matches(event),
                None => true,
            };
            if passes {
                out.push(connection_id);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Member count per active room.
    pub async fn room_stats(&self) -> Result<HashMap<String, usize>, ServerError> {
        let mut out = HashMap::new();
        for topic in self.store.smembers(ROOMS_INDEX).await? {
            let members = self.store.scard(&room_key(&topic)).await?;
            let _ = out.insert(topic, members);
        }
        Ok(out)
    }
}
