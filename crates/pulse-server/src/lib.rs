//! # pulse-server
//!
//! The subscriber-facing half of the pipeline: connection lifecycle, topic
//! rooms with per-subscriber filters, message routing with offline queues,
//! protection (rate limiting and circuit breaking), the client protocol,
//! and the HTTP operational surface.
//!
//! All connection and room state lives in the shared store, so any
//! horizontally-scaled instance can route to any connection's queue and
//! the registry survives instance restarts.

#![deny(unsafe_code)]

pub mod breaker;
pub mod errors;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod rooms;
pub mod router;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use errors::ServerError;
pub use protocol::{ClientMessage, ProtocolHandler, ServerMessage};
pub use ratelimit::{RateDecision, RateLimiter};
pub use registry::ConnectionRegistry;
pub use rooms::{RoomManager, SubscriptionFilter};
pub use router::{ConnectionTransport, DeliveryReport, MessageRouter, SendError};
