//! Session Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use crate::session::PeerId;
use derive_more::{Display, Error};

/// A session error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The peer has not been paired (or was unpaired).
    #[display("peer {_0} is not paired")]
    UnknownPeer(#[error(not(source))] PeerId),
    /// Downloading the peer's files could not proceed at all.
    #[display("transfer failed")]
    Transfer,
    /// The snapshot could not be applied at all.
    #[display("apply failed")]
    Apply,
    /// The session ended (peer left, unpaired or shutdown) or a newer
    /// snapshot superseded this one.
    #[display("sync cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer | Self::Apply)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Transfer.is_retryable());
        assert!(!ErrorKind::UnknownPeer(PeerId::new("someone")).is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(ErrorKind::Cancelled.is_cancellation());
    }
}
