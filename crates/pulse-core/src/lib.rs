//! # pulse-core
//!
//! Foundation types, errors, and utilities for the pulse event pipeline.
//!
//! This crate provides the shared vocabulary that all other pulse crates
//! depend on:
//!
//! - **Records**: [`records::RawRecord`] from the external change feed and
//!   [`records::DetectedChange`] produced by the change detector
//! - **Events**: the [`events::Event`] wire envelope with typed
//!   [`events::EventPayload`] variants, queue and dead-letter messages
//! - **Topics**: [`topics`] — broker channel naming and validation
//! - **Errors**: [`errors::PulseError`] taxonomy via `thiserror`
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//! - **Settings**: [`settings::PulseSettings`] with env overrides
//! - **Logging**: [`logging::init_logging`] tracing-subscriber setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other pulse crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod logging;
pub mod records;
pub mod retry;
pub mod settings;
pub mod time;
pub mod topics;
