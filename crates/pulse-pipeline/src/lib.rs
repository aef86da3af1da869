//! # pulse-pipeline
//!
//! The detection-to-distribution pipeline: raw change-feed records in,
//! published events out.
//!
//! Stages run strictly in order per batch:
//!
//! 1. [`detector`] — validate, dedupe, compare against the shared state
//!    cache, apply per-category significance thresholds
//! 2. [`generator`] — wrap each significant change in the versioned event
//!    envelope with correlation id, confidence, and routing tags
//! 3. [`distributor`] — fan out to broker topics and the durable priority
//!    queue concurrently, with bounded retries and a dead-letter fallback
//!
//! [`processor`] ties the stages together and owns the per-batch metrics.

#![deny(unsafe_code)]

pub mod detector;
pub mod distributor;
pub mod generator;
pub mod metrics;
pub mod processor;

pub use detector::{ChangeDetector, ChangeSummary, DetectionOutcome};
pub use distributor::{Broker, DistributionOutcome, Distributor, DurableQueue};
pub use generator::{DisplayMetadata, EventGenerator, MetadataSource};
pub use processor::{EventProcessor, ProcessingMetrics};
