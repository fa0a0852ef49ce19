//! Source Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A source error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The database or file is missing, locked, or not what we expected.
    /// Skip the kind for this run; the next run may succeed.
    #[display("source unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// Reading failed after extraction had started; the records seen so far
    /// are not a complete picture of the source.
    #[display("could not finish reading {_0}")]
    Read(#[error(not(source))] &'static str),
    /// A config file exists but cannot be parsed.
    #[display("invalid {_0} config: {_1}")]
    InvalidConfig(#[error(not(source))] &'static str, #[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Read(_))
    }
}
