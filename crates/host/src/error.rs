//! Host Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A host interaction error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The service is not connected (plugin unloaded, IPC not registered).
    #[display("service unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The object the call referred to no longer exists.
    #[display("object no longer exists")]
    ObjectGone,
    /// The service rejected the call or returned garbage.
    #[display("service call failed: {_0}")]
    Call(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Call(_))
    }
}
