//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tenderwatch"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("tenderwatch")
}

/// Counter: ingestion candidates evaluated.
/// Labels: `result` ("ok" | "skipped" | "failed" | "duplicate").
pub fn candidates_evaluated() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.ingest.candidates")
        .with_description("Number of ingestion candidates evaluated")
        .build()
}

/// Counter: analysis status transitions.
/// Labels: `from`, `to`.
pub fn analysis_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.analysis.state_transitions")
        .with_description("Number of analysis status transitions")
        .build()
}

/// Counter: phase outcomes.
/// Labels: `phase`, `outcome` ("ok" | "degraded" | "fatal").
pub fn phase_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.analysis.phase_outcomes")
        .with_description("Number of finished analysis phases by outcome")
        .build()
}

/// Counter: events published on the bus.
/// Labels: `event_type`.
pub fn bus_published() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.bus.published")
        .with_description("Number of events published")
        .build()
}

/// Counter: deliveries dropped because a subscriber channel was full.
pub fn bus_dropped() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.bus.dropped")
        .with_description("Number of event deliveries dropped for slow subscribers")
        .build()
}

/// Counter: client stream connections.
/// Labels: `mode` ("live" | "replay").
pub fn stream_connections() -> Counter<u64> {
    meter()
        .u64_counter("tenderwatch.stream.connections")
        .with_description("Number of client stream connections")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tenderwatch.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
