//! Bounded-parallelism iteration engine.
//!
//! Applies an asynchronous unit of work to every element of a sequence with
//! at most `max_concurrency` units executing at once. A bound of 1 runs the
//! elements strictly one after another and stops at the first failure; a
//! larger bound spawns every element onto the runtime, gated by an
//! [`AdmissionController`], and waits for all of them to settle.
//!
//! There is no cooperative cancellation: once a parallel run has started,
//! a failing element does not stop its siblings.

pub mod admission;
pub mod aggregate;

pub use admission::{AdmissionController, Permit};
pub use aggregate::Aggregator;

use crate::error::{BoxError, Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::run::{record_dispatched, start_run_span};
use opentelemetry::KeyValue;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{Instrument, Span, debug, info, warn};

const BOUND_PARAM: &str = "max_concurrency";

/// How a run dispatches its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One element at a time, in enumeration order.
    Sequential,
    /// Up to the bound in flight, spawned onto the runtime.
    Parallel,
}

impl Mode {
    pub fn for_bound(max_concurrency: usize) -> Self {
        if max_concurrency == 1 {
            Self::Sequential
        } else {
            Self::Parallel
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

/// Validate a signed concurrency bound, as read from configuration.
///
/// Zero and negative values are rejected identically.
pub fn concurrency_bound(value: i64) -> Result<usize> {
    if value < 1 {
        return Err(Error::OutOfRange {
            param: BOUND_PARAM,
            value,
        });
    }
    usize::try_from(value).map_err(|_| Error::OutOfRange {
        param: BOUND_PARAM,
        value,
    })
}

/// Builder for a single for-each run.
///
/// `items` and one of `action` / `indexed_action` are required;
/// `max_concurrency` defaults to 1. Set `items` first so the action's
/// argument types can be inferred.
///
/// ```no_run
/// # async fn demo() -> fanout::error::Result<()> {
/// use fanout::engine::ForEach;
///
/// ForEach::new()
///     .items(vec!["a", "b", "c"])
///     .action(|name| async move {
///         println!("{name}");
///         Ok::<_, std::io::Error>(())
///     })
///     .max_concurrency(2)
///     .run()
///     .await
/// # }
/// ```
pub struct ForEach<I, F> {
    items: Option<I>,
    action: Option<F>,
    max_concurrency: usize,
}

impl<I, F> Default for ForEach<I, F> {
    fn default() -> Self {
        Self {
            items: None,
            action: None,
            max_concurrency: 1,
        }
    }
}

impl<I, F> ForEach<I, F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(mut self, items: I) -> Self {
        self.items = Some(items);
        self
    }

    /// Unit of work taking the element, used by [`ForEach::run`].
    pub fn action<Fut>(mut self, action: F) -> Self
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
    {
        self.action = Some(action);
        self
    }

    /// Unit of work taking the element and its position, used by
    /// [`ForEach::run_indexed`].
    pub fn indexed_action<Fut>(mut self, action: F) -> Self
    where
        I: IntoIterator,
        F: FnMut(I::Item, usize) -> Fut,
    {
        self.action = Some(action);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    fn validate(self) -> Result<(I, F, usize)> {
        let items = self
            .items
            .ok_or(Error::InvalidArgument { param: "items" })?;
        let action = self
            .action
            .ok_or(Error::InvalidArgument { param: "action" })?;
        if self.max_concurrency == 0 {
            return Err(Error::OutOfRange {
                param: BOUND_PARAM,
                value: 0,
            });
        }
        Ok((items, action, self.max_concurrency))
    }

    /// Run `action(item)` for every item.
    pub async fn run<Fut, E>(self) -> Result<()>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (items, action, max_concurrency) = self.validate()?;
        dispatch(items.into_iter(), action, max_concurrency).await
    }

    /// Run `action(item, index)` for every item, where `index` is the
    /// zero-based enumeration position.
    pub async fn run_indexed<Fut, E>(self) -> Result<()>
    where
        I: IntoIterator,
        F: FnMut(I::Item, usize) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (items, mut action, max_concurrency) = self.validate()?;
        dispatch(
            items.into_iter().enumerate(),
            move |(index, item)| action(item, index),
            max_concurrency,
        )
        .await
    }
}

/// Run `action` for every element of `items` with at most
/// `max_concurrency` in flight.
pub async fn for_each<I, F, Fut, E>(items: I, action: F, max_concurrency: usize) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    ForEach::new()
        .items(items)
        .action(action)
        .max_concurrency(max_concurrency)
        .run()
        .await
}

/// Like [`for_each`], but `action` also receives the element's zero-based
/// position in the sequence.
pub async fn for_each_indexed<I, F, Fut, E>(
    items: I,
    action: F,
    max_concurrency: usize,
) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item, usize) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    ForEach::new()
        .items(items)
        .indexed_action(action)
        .max_concurrency(max_concurrency)
        .run_indexed()
        .await
}

/// Run `action` for every element strictly in order, stopping at the first
/// failure.
///
/// Nothing is spawned, so the futures may borrow local state and need not
/// be `Send`.
pub async fn for_each_sequential<I, F, Fut, E>(items: I, action: F) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Into<BoxError>,
{
    let span = start_run_span(Mode::Sequential, 1);
    let start = Instant::now();
    let result = run_sequential(items.into_iter(), action)
        .instrument(span.clone())
        .await;
    finish(&span, start, result)
}

async fn dispatch<It, G, Fut, E>(items: It, invoke: G, max_concurrency: usize) -> Result<()>
where
    It: Iterator,
    G: FnMut(It::Item) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let mode = Mode::for_bound(max_concurrency);
    let span = start_run_span(mode, max_concurrency);
    let start = Instant::now();

    let result = match mode {
        Mode::Sequential => run_sequential(items, invoke).instrument(span.clone()).await,
        Mode::Parallel => {
            run_parallel(items, invoke, max_concurrency)
                .instrument(span.clone())
                .await
        }
    };
    finish(&span, start, result)
}

fn finish(span: &Span, start: Instant, result: Dispatched) -> Result<()> {
    let (dispatched, outcome) = match result {
        Ok(dispatched) => (dispatched, Ok(())),
        Err((dispatched, e)) => (dispatched, Err(e)),
    };
    record_dispatched(span, dispatched);

    let label = if outcome.is_ok() { "ok" } else { "error" };
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::run_duration_ms().record(duration_ms, &[KeyValue::new("outcome", label)]);
    span.in_scope(|| info!(dispatched, outcome = label, duration_ms, "run settled"));

    outcome
}

type Dispatched = std::result::Result<usize, (usize, Error)>;

async fn run_sequential<It, G, Fut, E>(items: It, mut invoke: G) -> Dispatched
where
    It: Iterator,
    G: FnMut(It::Item) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Into<BoxError>,
{
    let started = metrics::units_started();
    let failed = metrics::units_failed();
    let attrs = [KeyValue::new("mode", Mode::Sequential.as_str())];

    let mut dispatched = 0;
    for item in items {
        dispatched += 1;
        started.add(1, &attrs);
        if let Err(e) = invoke(item).await {
            let e: BoxError = e.into();
            failed.add(1, &attrs);
            warn!(position = dispatched - 1, error = %e, "unit of work failed, stopping");
            return Err((dispatched, Error::unit_of_work(e)));
        }
    }
    Ok(dispatched)
}

async fn run_parallel<It, G, Fut, E>(items: It, mut invoke: G, max_concurrency: usize) -> Dispatched
where
    It: Iterator,
    G: FnMut(It::Item) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let started = metrics::units_started();
    let attrs = [KeyValue::new("mode", Mode::Parallel.as_str())];
    let admission = AdmissionController::new(max_concurrency);
    let mut aggregator = Aggregator::new(metrics::units_failed());

    let mut dispatched = 0;
    for item in items {
        let permit = match admission.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                // Admitted units still run to completion.
                let _ = aggregator.settle().await;
                return Err((dispatched, e));
            }
        };
        aggregator.reap_ready();

        debug!(position = dispatched, in_use = admission.in_use(), "unit admitted");
        started.add(1, &attrs);
        match panic::catch_unwind(AssertUnwindSafe(|| invoke(item))) {
            Ok(unit) => aggregator.spawn(permit, unit),
            Err(payload) => {
                drop(permit);
                aggregator.record_panic(payload);
            }
        }
        dispatched += 1;
    }

    aggregator
        .settle()
        .await
        .map(|()| dispatched)
        .map_err(|e| (dispatched, e))
}
