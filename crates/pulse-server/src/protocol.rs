//! Client protocol: message shapes and the per-connection handler.
//!
//! Clients speak JSON messages tagged by `type`. Heartbeats double as the
//! offline-queue drain trigger: every ping refreshes liveness and flushes
//! anything parked for the connection. Malformed or unknown messages get
//! an error reply, never a dropped connection. Subscribe requests carry a
//! channel list; invalid channels are rejected individually without
//! failing the valid ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pulse_core::events::Event;
use pulse_core::time::now_millis;

use crate::errors::ServerError;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomManager, SubscriptionFilter};
use crate::router::MessageRouter;

/// Messages a client may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Heartbeat; also triggers an offline-queue drain.
    Ping,
    /// Join topic rooms, optionally with a narrowing filter applied to
    /// each.
    Subscribe {
        /// Topics to join.
        channels: Vec<String>,
        /// Optional filter; absent means the whole room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<SubscriptionFilter>,
    },
    /// Leave topic rooms; no channel list means all of them.
    Unsubscribe {
        /// Topics to leave, or everything when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<Vec<String>>,
    },
}

/// Messages the server sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Heartbeat acknowledgement.
    Pong {
        /// Server time, epoch millis.
        timestamp: i64,
    },
    /// Subscription acknowledgement. Invalid channels are listed under
    /// `rejected`; the valid ones took effect.
    Subscribed {
        /// Channels now subscribed.
        channels: Vec<String>,
        /// Channels rejected as invalid.
        rejected: Vec<String>,
        /// Filter applied to the accepted channels, when one was given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<SubscriptionFilter>,
        /// Server time of the subscription, epoch millis.
        subscribed_at: i64,
    },
    /// Unsubscription acknowledgement.
    Unsubscribed {
        /// Channels left.
        channels: Vec<String>,
    },
    /// A routed event.
    Event {
        /// The event envelope.
        event: Box<Event>,
    },
    /// Request-level error; the connection stays open.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_owned())
    }
}

/// Per-connection protocol handler.
pub struct ProtocolHandler {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    router: Arc<MessageRouter>,
    limiter: Arc<RateLimiter>,
}

impl ProtocolHandler {
    /// Assemble a handler.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        router: Arc<MessageRouter>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            rooms,
            router,
            limiter,
        }
    }

    /// Register a newly opened connection.
    pub async fn connect(&self, connection_id: &str, auth_context: &str) -> Result<(), ServerError> {
        self.registry.register(connection_id, auth_context).await
    }

    /// Handle one raw inbound message, producing the reply.
    pub async fn handle(&self, connection_id: &str, raw: &str) -> ServerMessage {
        if let RateDecision::Blocked { retry_after_ms } =
            self.limiter.check_and_record(connection_id).await
        {
            return ServerMessage::Error {
                message: format!("rate limited, retry in {retry_after_ms}ms"),
            };
        }

        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id, error = %e, "unparsable client message");
                return ServerMessage::Error {
                    message: "malformed or unknown message".into(),
                };
            }
        };
        match message {
            ClientMessage::Ping => self.handle_ping(connection_id).await,
            ClientMessage::Subscribe { channels, filters } => {
                self.handle_subscribe(connection_id, channels, filters).await
            }
            ClientMessage::Unsubscribe { channels } => {
                self.handle_unsubscribe(connection_id, channels).await
            }
        }
    }

    async fn handle_ping(&self, connection_id: &str) -> ServerMessage {
        if let Err(e) = self.registry.heartbeat(connection_id).await {
            return ServerMessage::Error {
                message: e.to_string(),
            };
        }
        let drained = self.router.drain_queue(connection_id).await;
        if drained > 0 {
            debug!(connection_id, drained, "drained on heartbeat");
        }
        ServerMessage::Pong {
            timestamp: now_millis(),
        }
    }

    async fn handle_subscribe(
        &self,
        connection_id: &str,
        channels: Vec<String>,
        filters: Option<SubscriptionFilter>,
    ) -> ServerMessage {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for channel in channels {
            match self
                .rooms
                .subscribe(connection_id, &channel, filters.clone())
                .await
            {
                Ok(()) => accepted.push(channel),
                Err(ServerError::InvalidTopic(_)) => rejected.push(channel),
                Err(e) => {
                    return ServerMessage::Error {
                        message: e.to_string(),
                    };
                }
            }
        }
        ServerMessage::Subscribed {
            channels: accepted,
            rejected,
            filters,
            subscribed_at: now_millis(),
        }
    }

    async fn handle_unsubscribe(
        &self,
        connection_id: &str,
        channels: Option<Vec<String>>,
    ) -> ServerMessage {
        let channels = match channels {
            Some(channels) => channels,
            None => match self.rooms.subscriptions(connection_id).await {
                Ok(all) => all,
                Err(e) => {
                    return ServerMessage::Error {
                        message: e.to_string(),
                    };
                }
            },
        };
        for channel in &channels {
            if let Err(e) = self.rooms.unsubscribe(connection_id, channel).await {
                return ServerMessage::Error {
                    message: e.to_string(),
                };
            }
        }
        ServerMessage::Unsubscribed { channels }
    }

    /// Tear down a closed connection: rooms first, then the registry, so
    /// routing never resolves a member without a record.
    pub async fn disconnect(&self, connection_id: &str) {
        if let Err(e) = self.rooms.unsubscribe_all(connection_id).await {
            warn!(connection_id, error = %e, "room cleanup failed on disconnect");
        }
        if let Err(e) = self.registry.deregister(connection_id).await {
            warn!(connection_id, error = %e, "deregister failed on disconnect");
        }
    }
}
