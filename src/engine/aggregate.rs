//! Completion aggregation for parallel runs.
//!
//! Tracks every spawned unit of work and folds their results into a single
//! run outcome once all of them have settled. Nothing is aborted early.

use crate::error::{BoxError, Error, Result};
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use std::any::Any;
use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, Span, warn};

use super::admission::Permit;

pub struct Aggregator {
    tasks: JoinSet<std::result::Result<(), BoxError>>,
    first: Option<BoxError>,
    suppressed: Vec<BoxError>,
    panic: Option<Box<dyn Any + Send + 'static>>,
    cancelled: bool,
    failed: Counter<u64>,
}

impl Aggregator {
    pub fn new(failed: Counter<u64>) -> Self {
        Self {
            tasks: JoinSet::new(),
            first: None,
            suppressed: Vec::new(),
            panic: None,
            cancelled: false,
            failed,
        }
    }

    /// Spawn a unit of work that holds `permit` until it settles.
    ///
    /// The task runs inside the caller's current span.
    pub fn spawn<Fut, E>(&mut self, permit: Permit, unit: Fut)
    where
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.tasks.spawn(
            async move {
                let _permit = permit;
                unit.await.map_err(Into::into)
            }
            .instrument(Span::current()),
        );
    }

    /// Record a panic raised while building a unit of work. It is resumed
    /// by [`Aggregator::settle`] like a panic inside a spawned unit.
    pub fn record_panic(&mut self, payload: Box<dyn Any + Send + 'static>) {
        warn!("unit of work panicked before it was spawned");
        if self.panic.is_none() {
            self.panic = Some(payload);
        }
    }

    /// Record results of units that already finished, without waiting.
    pub fn reap_ready(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    /// Wait for every spawned unit, then report the run outcome.
    ///
    /// A panic inside a unit of work is resumed here, after the remaining
    /// units have settled.
    pub async fn settle(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }

        if let Some(payload) = self.panic {
            std::panic::resume_unwind(payload);
        }
        if let Some(source) = self.first {
            return Err(Error::UnitOfWork {
                source,
                suppressed: self.suppressed,
            });
        }
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn record(&mut self, joined: std::result::Result<std::result::Result<(), BoxError>, JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failed.add(1, &[KeyValue::new("mode", "parallel")]);
                warn!(error = %e, "unit of work failed");
                if self.first.is_none() {
                    self.first = Some(e);
                } else {
                    self.suppressed.push(e);
                }
            }
            Err(e) if e.is_panic() => {
                warn!("unit of work panicked");
                if self.panic.is_none() {
                    self.panic = Some(e.into_panic());
                }
            }
            Err(_) => self.cancelled = true,
        }
    }
}
