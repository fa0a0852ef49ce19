//! Engine Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures that abort a run before any kind is processed.
///
/// Everything that goes wrong while processing a kind is absorbed into the
/// run report instead.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The device identifier can be neither read nor persisted. Without it
    /// no row can be scoped, so the run does not start.
    #[display("device identity unavailable: {_0}")]
    IdentityUnavailable(#[error(not(source))] String),
    /// A configuration value cannot be turned into a working component.
    #[display("invalid configuration: {_0}")]
    Config(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IdentityUnavailable(_))
    }
}
