//! Apply Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use veneer_host::ObjectKind;

/// An apply error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for apply operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The mod service is not connected; nothing can be applied.
    #[display("mod service unavailable")]
    ModServiceUnavailable,
    /// The target object despawned while it was being modified.
    #[display("{_0} disappeared during the apply")]
    ObjectGone(#[error(not(source))] ObjectKind),
    /// A call into the host failed.
    #[display("host call failed")]
    Host,
    #[display("content cache error")]
    Cache,
    /// The snapshot could not be hashed.
    #[display("invalid snapshot")]
    Snapshot,
    /// Superseded by a newer apply, reverted or shut down.
    #[display("apply cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ObjectGone(_) | Self::Host | Self::Cache)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::ModServiceUnavailable, false)]
    #[case(ErrorKind::ObjectGone(ObjectKind::Pet), true)]
    #[case(ErrorKind::Host, true)]
    #[case(ErrorKind::Cancelled, false)]
    fn test_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }
}
