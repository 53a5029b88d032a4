//! Transfer Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failed, timed out or was reset mid-body.
    #[display("network error")]
    Network,
    /// The server does not know the file (or the ticket). Permanent.
    #[display("not found on the server: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The bearer token was rejected. Permanent until re-authenticated.
    #[display("unauthorized")]
    Unauthorized,
    /// Any other non-success status.
    #[display("server responded with status {_0}")]
    Status(#[error(not(source))] u16),
    /// The server answered with something that could not be decoded.
    #[display("invalid server response")]
    InvalidResponse,
    /// The server did not get the file ready before the queue deadline.
    #[display("timed out waiting in the download queue: {_0}")]
    QueueTimeout(#[error(not(source))] String),
    /// Reading or writing a local file failed.
    #[display("I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// The decompressed download does not hash to what was requested.
    #[display("corrupt transfer: {_0}")]
    HashMismatch(#[error(not(source))] String),
    #[display("compression error")]
    Compression,
    #[display("content cache error")]
    Cache,
    /// The client could not be configured (bad URL, TLS setup).
    #[display("invalid transfer configuration: {_0}")]
    Config(#[error(not(source))] String),
    /// The owning session was torn down.
    #[display("transfer cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::QueueTimeout(_) | Self::Io(_) | Self::HashMismatch(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
