//! # pulse-store
//!
//! Shared external key-value store abstraction and the state cache built
//! on it.
//!
//! All mutable pipeline state (previous values, dedup markers, connection
//! records, room memberships, offline queues, rate windows) lives in the
//! shared store — the single source of truth across horizontally-scaled
//! instances. Components receive an injected [`kv::SharedStore`] handle;
//! no component keeps authoritative state only in local memory.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `kv` | [`kv::SharedStore`] trait: strings, sets, sorted sets, lists |
//! | `memory` | In-process reference backend (tests, single-node runs) |
//! | `faulty` | Fault-injection wrapper for resilience tests |
//! | `state_cache` | Previous-value lookup + idempotency/dedup index |

#![deny(unsafe_code)]

pub mod faulty;
pub mod kv;
pub mod memory;
pub mod state_cache;

pub use faulty::FaultyStore;
pub use kv::{SharedStore, StoreError, StoreResult};
pub use memory::MemoryStore;
pub use state_cache::StateCache;
