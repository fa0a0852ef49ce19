//! Remote Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A remote store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Timeouts, connection failures, 408/429 and 5xx responses.
    #[display("remote store temporarily unavailable: {_0}")]
    Transient(#[error(not(source))] String),
    /// The store refused the request; sending it again will not help.
    #[display("remote store rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    /// A row carried a `device_id` other than the one it was written for.
    #[display("row is not scoped to device {_0}")]
    ScopeViolation(#[error(not(source))] String),
    /// A successful response body could not be decoded.
    #[display("unexpected response from remote store")]
    InvalidResponse,
    /// Client construction failed (bad URL, unusable header value).
    #[display("invalid remote store configuration: {_0}")]
    Config(#[error(not(source))] String),
    /// Every attempt allowed by the retry policy failed transiently.
    #[display("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
