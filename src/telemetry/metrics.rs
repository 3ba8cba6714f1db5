//! Metric instruments for the iteration engine.
//!
//! Created from the `"fanout"` meter on the globally-registered
//! `MeterProvider`; no-ops until one is installed.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

fn meter() -> Meter {
    opentelemetry::global::meter("fanout")
}

/// Counter: units of work invoked.
/// Labels: `mode` ("sequential" | "parallel").
pub fn units_started() -> Counter<u64> {
    meter()
        .u64_counter("fanout.units.started")
        .with_description("Number of units of work invoked")
        .build()
}

/// Counter: units of work that returned an error.
/// Labels: `mode`.
pub fn units_failed() -> Counter<u64> {
    meter()
        .u64_counter("fanout.units.failed")
        .with_description("Number of units of work that failed")
        .build()
}

/// Up-down counter: units of work currently holding an admission permit.
pub fn units_in_flight() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("fanout.units.in_flight")
        .with_description("Units of work holding an admission permit")
        .build()
}

/// Histogram: time the dispatcher waited for an admission permit.
pub fn admission_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fanout.admission.wait_ms")
        .with_description("Time spent waiting for an admission permit")
        .with_unit("ms")
        .build()
}

/// Histogram: wall time of a whole run.
/// Labels: `outcome` ("ok" | "error").
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fanout.run.duration_ms")
        .with_description("Duration of a for-each run")
        .with_unit("ms")
        .build()
}
