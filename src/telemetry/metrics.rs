//! Metric instrument factories for relayq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"relayq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for relayq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("relayq")
}

/// Counter: queue-level operations (push, pop, blocking_pop, clear).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("relayq.queue.operations")
        .with_description("Number of store queue operations")
        .build()
}

/// Counter: items handed to user code by a dispatch loop.
/// Labels: `queue`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("relayq.work.dispatched")
        .with_description("Number of work items dispatched to workers")
        .build()
}

/// Counter: completions that won their working-set eviction.
/// Labels: `queue`, `outcome` ("completed" | "error" | "timeout").
pub fn work_completed() -> Counter<u64> {
    meter()
        .u64_counter("relayq.work.completed")
        .with_description("Number of work items routed to a completed queue")
        .build()
}

/// Counter: completion attempts dropped because another event already won.
/// Labels: `queue`.
pub fn duplicate_completions() -> Counter<u64> {
    meter()
        .u64_counter("relayq.work.duplicate_completions")
        .with_description("Late or repeated completion attempts discarded")
        .build()
}

/// Histogram: dispatched-to-finished wall time in milliseconds.
/// Labels: `queue`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relayq.work.duration_ms")
        .with_description("Work execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
