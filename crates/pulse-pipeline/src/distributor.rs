//! Distributor: broker fan-out plus the durable priority queue.
//!
//! Every event is published to its kind topic on the broker, and value
//! updates also to their entity and category topics (best-effort:
//! failures are retried, then logged and dropped), and — when tagged as actionable — enqueued on the durable
//! priority queue (at-least-once: retry exhaustion dead-letters the event
//! rather than dropping it). The two sides are independent; neither blocks
//! or fails the other.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, error, warn};

use pulse_core::errors::Result;
use pulse_core::events::{
    DeadLetterMessage, ErrorInfo, Event, EventPayload, QueueMessage, QueuePriority,
};
use pulse_core::retry::RetryConfig;
use pulse_core::time::now_millis;
use pulse_core::topics::{category_topic, entity_topic, kind_topic};

/// Pub/sub broker used for real-time fan-out.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an event to one topic.
    async fn publish(&self, topic: &str, event: &Event) -> Result<()>;
}

/// Durable priority queue for the downstream alert consumer.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Enqueue a prioritized message.
    async fn enqueue(&self, message: &QueueMessage) -> Result<()>;

    /// Record a message that exhausted its retries.
    async fn dead_letter(&self, message: &DeadLetterMessage) -> Result<()>;
}

/// Broker topics an event is published to.
///
/// Every event reaches its kind topic; value updates additionally fan out
/// to their entity and category topics. Structural events stay on
/// `events:structural-update` alone.
pub fn topics_for(event: &Event) -> Vec<String> {
    let mut topics = vec![kind_topic(event.event_type)];
    if matches!(event.data, EventPayload::ValueUpdate(_)) {
        topics.push(entity_topic(event.entity_id()));
        topics.push(category_topic(event.category()));
    }
    topics
}

/// Durable-queue priority for an event, from its magnitude tags.
///
/// Untagged events are not queued: the queue carries only actionable
/// changes.
pub fn priority_for(event: &Event) -> Option<QueuePriority> {
    if event.has_tag("extreme-change") {
        Some(QueuePriority::High)
    } else if event.has_tag("large-change") {
        Some(QueuePriority::Medium)
    } else {
        None
    }
}

/// Outcome of distributing one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DistributionOutcome {
    /// Broker topics the event reached.
    pub topics_published: usize,
    /// Broker topics that failed after retries.
    pub topics_failed: usize,
    /// Whether the event landed on the durable queue.
    pub queued: bool,
    /// Whether the event was dead-lettered after queue retry exhaustion.
    pub dead_lettered: bool,
}

/// Fans events out to the broker and the durable queue.
pub struct Distributor {
    broker: Arc<dyn Broker>,
    queue: Arc<dyn DurableQueue>,
    retry: RetryConfig,
}

impl Distributor {
    /// Build a distributor with the given retry policy.
    pub fn new(broker: Arc<dyn Broker>, queue: Arc<dyn DurableQueue>, retry: RetryConfig) -> Self {
        Self {
            broker,
            queue,
            retry,
        }
    }

    /// Distribute one event to both sides concurrently.
    pub async fn distribute(&self, event: &Event) -> DistributionOutcome {
        let (broker_side, queue_side) =
            tokio::join!(self.publish_topics(event), self.enqueue_actionable(event));
        let (topics_published, topics_failed) = broker_side;
        let (queued, dead_lettered) = queue_side;
        DistributionOutcome {
            topics_published,
            topics_failed,
            queued,
            dead_lettered,
        }
    }

    async fn publish_topics(&self, event: &Event) -> (usize, usize) {
        let mut published = 0;
        let mut failed = 0;
        for topic in topics_for(event) {
            match self
                .with_retry(|| self.broker.publish(&topic, event))
                .await
            {
                Ok(()) => {
                    counter!(crate::metrics::BROKER_PUBLISHED_TOTAL).increment(1);
                    published += 1;
                }
                Err(e) => {
                    // Best-effort side: log and move on.
                    counter!(crate::metrics::BROKER_FAILED_TOTAL).increment(1);
                    warn!(event_id = %event.event_id, topic = %topic, error = %e, "broker publish dropped after retries");
                    failed += 1;
                }
            }
        }
        (published, failed)
    }

    async fn enqueue_actionable(&self, event: &Event) -> (bool, bool) {
        let Some(priority) = priority_for(event) else {
            return (false, false);
        };
        let mut retry_count = 0;
        let result = self
            .with_retry(|| {
                let message = QueueMessage {
                    event: event.clone(),
                    priority,
                    retry_count,
                    timestamp: now_millis(),
                };
                retry_count += 1;
                async move { self.queue.enqueue(&message).await }
            })
            .await;
        match result {
            Ok(()) => {
                counter!(crate::metrics::QUEUE_ENQUEUED_TOTAL).increment(1);
                (true, false)
            }
            Err(e) => {
                counter!(crate::metrics::QUEUE_DEAD_LETTERED_TOTAL).increment(1);
                let dead = DeadLetterMessage {
                    event: event.clone(),
                    error: ErrorInfo {
                        message: e.to_string(),
                        detail: None,
                    },
                    timestamp: now_millis(),
                };
                if let Err(dlq_err) = self.queue.dead_letter(&dead).await {
                    // Last resort: the event survives only in the logs.
                    error!(event_id = %event.event_id, error = %dlq_err, "dead-letter write failed");
                }
                (false, true)
            }
        }
    }

    /// Run `op` up to `max_attempts` times, backing off between attempts.
    /// Non-retryable errors abort immediately.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
