//! Typed configuration from environment variables.
//!
//! Loaded once at startup. Nothing is required; a malformed value fails fast.

use crate::engine::concurrency_bound;
use crate::error::{Error, Result};

pub const MAX_CONCURRENCY_VAR: &str = "FANOUT_MAX_CONCURRENCY";

#[derive(Debug, Clone)]
pub struct Config {
    /// Default concurrency bound for runs that do not set one.
    pub max_concurrency: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let max_concurrency = match std::env::var(MAX_CONCURRENCY_VAR) {
            Ok(raw) => parse_bound(&raw)?,
            Err(_) => 1,
        };

        Ok(Self {
            max_concurrency,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Parse a concurrency bound from text. Zero and negatives are out of range.
pub fn parse_bound(raw: &str) -> Result<usize> {
    let value: i64 = raw.trim().parse().map_err(|e| {
        Error::Config(format!("{MAX_CONCURRENCY_VAR} is not an integer ({raw:?}): {e}"))
    })?;
    concurrency_bound(value)
}
