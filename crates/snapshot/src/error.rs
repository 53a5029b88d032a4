//! Snapshot Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use veneer_host::ObjectKind;

/// A snapshot error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for snapshot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The mod service is not connected; nothing can be resolved.
    #[display("mod service unavailable")]
    ModServiceUnavailable,
    /// The object exists but did not finish loading in time.
    #[display("{_0} did not finish loading")]
    NotLoaded(#[error(not(source))] ObjectKind),
    /// The object disappeared while it was being inspected.
    #[display("{_0} disappeared during the build")]
    ObjectGone(#[error(not(source))] ObjectKind),
    /// A call into the host failed.
    #[display("host call failed")]
    Host,
    #[display("snapshot serialization failed")]
    Serialization,
    /// Superseded by a newer build or shut down.
    #[display("build cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLoaded(_) | Self::ObjectGone(_) | Self::Host)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
