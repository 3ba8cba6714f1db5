//! Error types for fanout.

use thiserror::Error;

/// Boxed error produced by a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {param} must be provided")]
    InvalidArgument { param: &'static str },

    #[error("{param} out of range: {value} (must be at least 1)")]
    OutOfRange { param: &'static str, value: i64 },

    /// First observed failure of a unit of work. Failures observed after it
    /// are kept in `suppressed`.
    #[error("unit of work failed: {source}")]
    UnitOfWork {
        #[source]
        source: BoxError,
        suppressed: Vec<BoxError>,
    },

    #[error("unit of work was cancelled before it settled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a single unit-of-work failure.
    pub fn unit_of_work(source: impl Into<BoxError>) -> Self {
        Self::UnitOfWork {
            source: source.into(),
            suppressed: Vec::new(),
        }
    }

    /// Failures that settled after the reported one, if any.
    pub fn suppressed(&self) -> &[BoxError] {
        match self {
            Self::UnitOfWork { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
