//! Metric name constants for the ingestion pipeline.

/// Broker topic publishes that succeeded (counter).
pub const BROKER_PUBLISHED_TOTAL: &str = "pulse_broker_published_total";
/// Broker topic publishes that failed after retries (counter).
pub const BROKER_FAILED_TOTAL: &str = "pulse_broker_failed_total";
/// Events placed on the durable queue (counter).
pub const QUEUE_ENQUEUED_TOTAL: &str = "pulse_queue_enqueued_total";
/// Events dead-lettered after retry exhaustion (counter).
pub const QUEUE_DEAD_LETTERED_TOTAL: &str = "pulse_queue_dead_lettered_total";
/// Events generated across all batches (counter).
pub const EVENTS_GENERATED_TOTAL: &str = "pulse_events_generated_total";
/// Batch wall-clock duration in milliseconds (histogram).
pub const BATCH_DURATION_MS: &str = "pulse_batch_duration_ms";
