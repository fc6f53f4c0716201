//! # relayq
//!
//! Distributed work-distribution engine: producers enqueue opaque payloads
//! on a named logical queue, independently-scaled worker processes execute
//! them, and finished records route back to the producer instance that
//! submitted them.
//!
//! Coordination happens entirely through a shared store ([`store::Store`]):
//! a pending FIFO, an in-flight working set, a worker counter, and pub/sub
//! channels. The engine guarantees at-least-once dispatch, idempotent
//! completion, per-subscription throttling, per-item timeout supervision,
//! and a cooperative stop protocol.

pub mod config;
pub mod engine;
pub mod error;
pub mod fork;
pub mod keys;
pub mod model;
pub mod store;
pub mod telemetry;
