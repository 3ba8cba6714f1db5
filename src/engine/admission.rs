//! Admission control: a counting semaphore capping units of work in flight.

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::metrics::{Histogram, UpDownCounter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Hands out at most `capacity` permits at a time.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: UpDownCounter<i64>,
    wait_ms: Histogram<f64>,
}

/// The right to have one unit of work executing.
///
/// Released on drop, whether the unit of work succeeded, failed or panicked.
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_flight: UpDownCounter<i64>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.add(-1, &[]);
    }
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: metrics::units_in_flight(),
            wait_ms: metrics::admission_wait_ms(),
        }
    }

    /// Suspend until a permit is free, then take it.
    pub async fn acquire(&self) -> Result<Permit> {
        let start = Instant::now();
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("admission semaphore closed".to_string()))?;

        self.wait_ms
            .record(start.elapsed().as_secs_f64() * 1000.0, &[]);
        self.in_flight.add(1, &[]);

        Ok(Permit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently outstanding.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
