//! Span helpers for a single for-each run.

use tracing::Span;
use uuid::Uuid;

use crate::engine::Mode;

/// Start the span covering one run.
///
/// `run.dispatched` is declared empty and filled by [`record_dispatched`]
/// once the sequence has been walked.
pub fn start_run_span(mode: Mode, max_concurrency: usize) -> Span {
    tracing::info_span!(
        "fanout.run",
        "run.id" = %Uuid::new_v4(),
        "run.mode" = mode.as_str(),
        "run.max_concurrency" = max_concurrency,
        "run.dispatched" = tracing::field::Empty,
    )
}

/// Record how many units of work were dispatched.
pub fn record_dispatched(span: &Span, dispatched: usize) {
    span.record("run.dispatched", dispatched);
}
