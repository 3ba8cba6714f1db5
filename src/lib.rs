//! # fanout
//!
//! Bounded-parallelism asynchronous iteration.
//!
//! [`for_each`] and [`for_each_indexed`] apply an async unit of work to every
//! element of a sequence with at most `max_concurrency` units in flight.
//! The crate also carries env configuration, tracing/OpenTelemetry setup and
//! TOML command jobs for the `fanout` binary.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod telemetry;

pub use engine::{ForEach, for_each, for_each_indexed, for_each_sequential};
pub use error::{Error, Result};
