//! Message router: fan-out to live connections with per-connection
//! offline queues.
//!
//! Delivery never blocks on a slow or absent consumer. A transient send
//! failure or timeout lands the payload on the connection's capped
//! offline queue (`queue:<id>`, oldest dropped beyond the cap), drained
//! oldest-first on the connection's next heartbeat. A send the transport
//! reports as gone drops the payload and retires the registration
//! instead; routing passes prune gone-dead members from their rooms.
//! Outbound sends to rate-limited connections are queued instead of
//! sent, counted separately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use pulse_core::events::Event;
use pulse_core::settings::DeliverySettings;
use pulse_pipeline::distributor::topics_for;
use pulse_store::{SharedStore, StoreResult};

use crate::errors::ServerError;
use crate::protocol::ServerMessage;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

fn queue_key(connection_id: &str) -> String {
    format!("queue:{connection_id}")
}

/// Transport-level send failure.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection is closed on this instance.
    #[error("connection gone")]
    Gone,
    /// The send failed for a hopefully-temporary reason.
    #[error("send failed: {0}")]
    Transient(String),
}

/// Handle to the underlying connection transport (the socket layer).
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Send one payload to one connection.
    async fn send(&self, connection_id: &str, payload: &str) -> Result<(), SendError>;
}

/// Per-delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Payloads delivered directly.
    pub sent: usize,
    /// Sends that failed or timed out (whatever happened to the payload
    /// afterwards).
    pub failed: usize,
    /// Payloads parked on offline queues after a failed or timed-out send.
    pub queued: usize,
    /// Payloads parked because the connection is rate limited.
    pub rate_limited: usize,
    /// Payloads lost: the connection was gone, or the queue write failed
    /// after a failed send.
    pub dropped: usize,
}

impl DeliveryReport {
    fn absorb(&mut self, other: DeliveryReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.queued += other.queued;
        self.rate_limited += other.rate_limited;
        self.dropped += other.dropped;
    }
}

/// Routes serialized messages to connections.
pub struct MessageRouter {
    store: Arc<dyn SharedStore>,
    transport: Arc<dyn ConnectionTransport>,
    registry: Option<Arc<ConnectionRegistry>>,
    limiter: Option<Arc<RateLimiter>>,
    settings: DeliverySettings,
}

impl MessageRouter {
    /// Build a router. Pass a registry to skip the transport for
    /// connections already past their heartbeat window, and a limiter to
    /// throttle outbound sends per connection; `None` disables either.
    pub fn new(
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn ConnectionTransport>,
        registry: Option<Arc<ConnectionRegistry>>,
        limiter: Option<Arc<RateLimiter>>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            limiter,
            settings,
        }
    }

    /// Resolve an event's subscribers across all of its topics and deliver
    /// it once per connection, filters applied.
    ///
    /// Members past their heartbeat window are pruned from the topic's
    /// room instead of being routed to.
    pub async fn route_event(
        &self,
        rooms: &RoomManager,
        event: &Event,
    ) -> Result<DeliveryReport, ServerError> {
        let mut recipients: Vec<String> = Vec::new();
        for topic in topics_for(event) {
            for connection_id in rooms.filtered_subscribers(&topic, event).await? {
                if let Some(registry) = &self.registry
                    && !registry.is_live(&connection_id).await.unwrap_or(true)
                {
                    debug!(connection_id, topic, "pruning dead room member");
                    rooms.unsubscribe(&connection_id, &topic).await?;
                    continue;
                }
                if !recipients.contains(&connection_id) {
                    recipients.push(connection_id);
                }
            }
        }
        let payload = ServerMessage::Event {
            event: Box::new(event.clone()),
        }
        .to_json();
        Ok(self.deliver(&recipients, &payload).await)
    }

    /// Deliver one payload to many connections, in bounded concurrent
    /// chunks.
    pub async fn deliver(&self, recipients: &[String], payload: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for chunk in recipients.chunks(self.settings.batch_size.max(1)) {
            let sends = chunk.iter().map(|id| self.send_one(id, payload));
            for outcome in join_all(sends).await {
                report.absorb(outcome);
            }
        }
        counter!(crate::metrics::MESSAGES_SENT_TOTAL).increment(report.sent as u64);
        counter!(crate::metrics::MESSAGES_QUEUED_TOTAL)
            .increment((report.queued + report.rate_limited) as u64);
        counter!(crate::metrics::MESSAGES_DROPPED_TOTAL).increment(report.dropped as u64);
        report
    }

    async fn send_one(&self, connection_id: &str, payload: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if let Some(limiter) = &self.limiter
            && !limiter.check_and_record(connection_id).await.is_allowed()
        {
            match self.enqueue_offline(connection_id, payload).await {
                Ok(()) => report.rate_limited += 1,
                Err(_) => report.dropped += 1,
            }
            return report;
        }

        // Known-dead connections skip the transport entirely; the payload
        // waits on the queue until the reaper or a reconnect settles it.
        if let Some(registry) = &self.registry
            && !registry.is_live(connection_id).await.unwrap_or(true)
        {
            match self.enqueue_offline(connection_id, payload).await {
                Ok(()) => report.queued += 1,
                Err(_) => report.dropped += 1,
            }
            return report;
        }

        let timeout = Duration::from_millis(self.settings.send_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.send(connection_id, payload)).await {
            Ok(Ok(())) => report.sent += 1,
            Ok(Err(SendError::Gone)) => {
                // The connection no longer exists; queueing would strand
                // the payload until its TTL. Drop it and retire the
                // registration.
                debug!(connection_id, "connection gone, dropping payload");
                report.failed += 1;
                report.dropped += 1;
                if let Some(registry) = &self.registry
                    && let Err(e) = registry.deregister(connection_id).await
                {
                    warn!(connection_id, error = %e, "deregistering gone connection failed");
                }
            }
            Ok(Err(SendError::Transient(reason))) => {
                debug!(connection_id, reason = %reason, "send failed, queueing");
                report.failed += 1;
                self.park(connection_id, payload, &mut report).await;
            }
            Err(_) => {
                warn!(connection_id, "send timed out, queueing");
                report.failed += 1;
                self.park(connection_id, payload, &mut report).await;
            }
        }
        report
    }

    async fn park(&self, connection_id: &str, payload: &str, report: &mut DeliveryReport) {
        match self.enqueue_offline(connection_id, payload).await {
            Ok(()) => report.queued += 1,
            Err(e) => {
                warn!(connection_id, error = %e, "offline queue write failed, dropping");
                report.dropped += 1;
            }
        }
    }

    /// Park a payload on a connection's offline queue.
    pub async fn enqueue_offline(&self, connection_id: &str, payload: &str) -> StoreResult<()> {
        let key = queue_key(connection_id);
        let _ = self
            .store
            .lpush_trim(&key, payload, self.settings.queue_cap)
            .await?;
        let _ = self
            .store
            .expire(&key, Duration::from_secs(self.settings.queue_ttl_secs))
            .await?;
        Ok(())
    }

    /// Drain a connection's offline queue oldest-first.
    ///
    /// Stops at the first failed send; the failed payload goes back to the
    /// front of the drain order so nothing is reordered or lost.
    pub async fn drain_queue(&self, connection_id: &str) -> usize {
        let key = queue_key(connection_id);
        let mut drained = 0;
        loop {
            let payload = match self.store.rpop(&key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(connection_id, error = %e, "queue drain read failed");
                    break;
                }
            };
            let timeout = Duration::from_millis(self.settings.send_timeout_ms);
            let ok = matches!(
                tokio::time::timeout(timeout, self.transport.send(connection_id, &payload)).await,
                Ok(Ok(()))
            );
            if ok {
                drained += 1;
                continue;
            }
            if let Err(e) = self.store.rpush(&key, &payload).await {
                warn!(connection_id, error = %e, "failed to re-queue payload, dropping");
            }
            break;
        }
        if drained > 0 {
            debug!(connection_id, drained, "offline queue drained");
        }
        drained
    }

    /// Depth of a connection's offline queue.
    pub async fn queue_depth(&self, connection_id: &str) -> usize {
        self.store
            .llen(&queue_key(connection_id))
            .await
            .unwrap_or(0)
    }

    /// Nonzero offline-queue depths for the given connections.
    pub async fn queue_depths(
        &self,
        connection_ids: &[String],
    ) -> std::collections::HashMap<String, usize> {
        let mut out = std::collections::HashMap::new();
        for connection_id in connection_ids {
            let depth = self.queue_depth(connection_id).await;
            if depth > 0 {
                let _ = out.insert(connection_id.clone(), depth);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use dashmap::DashMap;
    use parking_lot::RwLock;

    use pulse_core::events::{
        EVENT_VERSION, EventKind, EventMetadata, EventPayload, ValueUpdatePayload,
    };
    use pulse_core::records::ChangeCategory;
    use pulse_core::settings::{ConnectionSettings, RateLimitSettings};
    use pulse_store::MemoryStore;

    #[derive(Default)]
    struct RecordingTransport {
        delivered: DashMap<String, Vec<String>>,
        offline: RwLock<HashSet<String>>,
        gone: RwLock<HashSet<String>>,
    }

    impl RecordingTransport {
        fn set_offline(&self, connection_id: &str, offline: bool) {
            if offline {
                let _ = self.offline.write().insert(connection_id.to_owned());
            } else {
                let _ = self.offline.write().remove(connection_id);
            }
        }

        fn set_gone(&self, connection_id: &str) {
            let _ = self.gone.write().insert(connection_id.to_owned());
        }

        fn received(&self, connection_id: &str) -> Vec<String> {
            self.delivered
                .get(connection_id)
                .map(|v| v.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ConnectionTransport for RecordingTransport {
        async fn send(&self, connection_id: &str, payload: &str) -> Result<(), SendError> {
            if self.gone.read().contains(connection_id) {
                return Err(SendError::Gone);
            }
            if self.offline.read().contains(connection_id) {
                return Err(SendError::Transient("connection offline".into()));
            }
            self.delivered
                .entry(connection_id.to_owned())
                .or_default()
                .push(payload.to_owned());
            Ok(())
        }
    }

    fn value_event(entity_id: &str) -> Event {
        Event {
            event_id: "e-1".into(),
            event_type: EventKind::ValueUpdate,
            timestamp: 1_700_000_000_000,
            source: "feed".into(),
            version: EVENT_VERSION.into(),
            metadata: EventMetadata {
                correlation_id: format!("price:{entity_id}-472"),
                confidence: 0.9,
                processing_time_ms: 1,
                retry_count: 0,
                tags: vec!["value-metric".into(), entity_id.to_owned()],
            },
            data: EventPayload::ValueUpdate(ValueUpdatePayload {
                entity_id: entity_id.to_owned(),
                entity_key: format!("price:{entity_id}"),
                category: ChangeCategory::ValueMetric,
                previous_value: 2_500.0,
                current_value: 2_750.0,
                change_percent: 10.0,
                change_absolute: 250.0,
                display_name: None,
                symbol: None,
            }),
        }
    }

    fn router(
        store: Arc<dyn SharedStore>,
        transport: Arc<RecordingTransport>,
    ) -> MessageRouter {
        MessageRouter::new(store, transport, None, None, DeliverySettings::default())
    }

    #[tokio::test]
    async fn delivers_to_all_recipients() {
        let transport = Arc::new(RecordingTransport::default());
        let r = router(Arc::new(MemoryStore::new()), Arc::clone(&transport));
        let recipients: Vec<String> = (0..250).map(|i| format!("c{i}")).collect();
        let report = r.deliver(&recipients, "hello").await;
        assert_eq!(report.sent, 250);
        assert_eq!(report.queued, 0);
        assert_eq!(transport.received("c0"), vec!["hello".to_string()]);
        assert_eq!(transport.received("c249"), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn failed_sends_are_queued_not_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        transport.set_offline("c2", true);
        let r = router(Arc::new(MemoryStore::new()), Arc::clone(&transport));
        let report = r
            .deliver(&["c1".into(), "c2".into()], "payload")
            .await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(r.queue_depth("c2").await, 1);
    }

    #[tokio::test]
    async fn dead_connections_skip_the_transport() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&store),
            // Zero-width heartbeat window: registered connections are
            // immediately stale.
            ConnectionSettings {
                heartbeat_timeout_ms: 0,
                ..ConnectionSettings::default()
            },
        ));
        registry.register("c1", "api-key:alpha").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let transport = Arc::new(RecordingTransport::default());
        let r = MessageRouter::new(
            store,
            Arc::clone(&transport) as Arc<dyn ConnectionTransport>,
            Some(registry),
            None,
            DeliverySettings::default(),
        );
        let report = r.deliver(&["c1".into()], "m0").await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.queued, 1);
        assert!(transport.received("c1").is_empty());
        assert_eq!(r.queue_depth("c1").await, 1);
    }

    #[tokio::test]
    async fn drain_preserves_fifo_order() {
        let transport = Arc::new(RecordingTransport::default());
        transport.set_offline("c1", true);
        let r = router(Arc::new(MemoryStore::new()), Arc::clone(&transport));
        for i in 0..3 {
            let _ = r.deliver(&["c1".into()], &format!("m{i}")).await;
        }
        assert_eq!(r.queue_depth("c1").await, 3);

        transport.set_offline("c1", false);
        let drained = r.drain_queue("c1").await;
        assert_eq!(drained, 3);
        assert_eq!(
            transport.received("c1"),
            vec!["m0".to_string(), "m1".to_string(), "m2".to_string()]
        );
        assert_eq!(r.queue_depth("c1").await, 0);
    }

    #[tokio::test]
    async fn drain_stops_at_first_failure_and_requeues() {
        let transport = Arc::new(RecordingTransport::default());
        transport.set_offline("c1", true);
        let r = router(Arc::new(MemoryStore::new()), Arc::clone(&transport));
        for i in 0..2 {
            let _ = r.deliver(&["c1".into()], &format!("m{i}")).await;
        }
        // Still offline: nothing drains, nothing is lost.
        let drained = r.drain_queue("c1").await;
        assert_eq!(drained, 0);
        assert_eq!(r.queue_depth("c1").await, 2);

        transport.set_offline("c1", false);
        assert_eq!(r.drain_queue("c1").await, 2);
        assert_eq!(transport.received("c1"), vec!["m0".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn queue_cap_drops_oldest() {
        let transport = Arc::new(RecordingTransport::default());
        transport.set_offline("c1", true);
        let settings = DeliverySettings {
            queue_cap: 2,
            ..DeliverySettings::default()
        };
        let r = MessageRouter::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&transport) as Arc<dyn ConnectionTransport>,
            None,
            None,
            settings,
        );
        for i in 0..4 {
            let _ = r.deliver(&["c1".into()], &format!("m{i}")).await;
        }
        assert_eq!(r.queue_depth("c1").await, 2);
        transport.set_offline("c1", false);
        let _ = r.drain_queue("c1").await;
        // Oldest two were dropped at the cap.
        assert_eq!(transport.received("c1"), vec!["m2".to_string(), "m3".to_string()]);
    }

    #[tokio::test]
    async fn rate_limited_sends_are_parked_and_counted() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            RateLimitSettings {
                max_requests: 1,
                ..RateLimitSettings::default()
            },
        ));
        let r = MessageRouter::new(
            store,
            Arc::clone(&transport) as Arc<dyn ConnectionTransport>,
            None,
            Some(limiter),
            DeliverySettings::default(),
        );
        let first = r.deliver(&["c1".into()], "m0").await;
        assert_eq!(first.sent, 1);
        let second = r.deliver(&["c1".into()], "m1").await;
        assert_eq!(second.sent, 0);
        assert_eq!(second.rate_limited, 1);
        assert_eq!(r.queue_depth("c1").await, 1);
    }

    #[tokio::test]
    async fn gone_connection_is_deregistered_and_payload_dropped() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&store),
            ConnectionSettings::default(),
        ));
        registry.register("c1", "api-key:alpha").await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        transport.set_gone("c1");
        let r = MessageRouter::new(
            store,
            Arc::clone(&transport) as Arc<dyn ConnectionTransport>,
            Some(Arc::clone(&registry)),
            None,
            DeliverySettings::default(),
        );
        let report = r.deliver(&["c1".into()], "m0").await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.queued, 0);
        // Nothing waits for a connection that no longer exists.
        assert_eq!(r.queue_depth("c1").await, 0);
        assert!(!registry.is_live("c1").await.unwrap());
        assert!(registry.connection_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn route_event_prunes_dead_room_members() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&store),
            ConnectionSettings::default(),
        ));
        registry.register("live", "api-key:alpha").await.unwrap();
        // "ghost" joined a room but has no registry record.
        let rooms = RoomManager::new(Arc::clone(&store));
        rooms.subscribe("live", "events:value-update", None).await.unwrap();
        rooms.subscribe("ghost", "events:value-update", None).await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let r = MessageRouter::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn ConnectionTransport>,
            Some(registry),
            None,
            DeliverySettings::default(),
        );
        let event = value_event("ethereum");
        let report = r.route_event(&rooms, &event).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(transport.received("live").len(), 1);
        assert!(transport.received("ghost").is_empty());
        assert_eq!(r.queue_depth("ghost").await, 0);

        let remaining = rooms
            .filtered_subscribers("events:value-update", &event)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["live".to_string()]);
    }
}
