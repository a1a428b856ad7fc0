//! Error and disconnect-reason types.
//!
//! Every fallible public operation returns [`Result`]. Errors that are
//! raised asynchronously (inside a selector thread) are delivered through
//! the exception callbacks instead and never unwind across connections.

use std::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by fluentis.
#[derive(Debug, Error)]
pub enum Error {
    /// An operating-system level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection (or selector) is already closed.
    #[error("connection closed")]
    Closed,

    /// A read request was registered with a length of zero.
    #[error("read length must be greater than zero")]
    InvalidLength,

    /// A read request asked for more bytes than the read buffer can hold.
    #[error("read request of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    RequestTooLarge {
        /// Length of the rejected request.
        requested: usize,
        /// Capacity of the connection's read buffer.
        capacity: usize,
    },

    /// Port `0` was given where a concrete port is required.
    #[error("invalid port")]
    InvalidPort,

    /// A callback that must be installed before the operation was missing.
    #[error("missing required callback: {0}")]
    MissingCallback(&'static str),

    /// `connect_timeout` elapsed before the peer answered.
    #[error("connect timed out")]
    ConnectTimeout,

    /// A user callback panicked while running on a selector thread.
    #[error("callback panicked: {0}")]
    CallbackPanicked(String),
}

/// Why a connection was closed.
///
/// Exactly one reason is recorded per connection: the cause that won the
/// race to close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// `close()` or `close_urgent()` was called locally.
    User,
    /// The peer closed its side cleanly (read returned end-of-stream).
    RemoteClose,
    /// The peer went away abruptly (reset, broken pipe, forcibly closed).
    RemoteCloseByException,
    /// Any other fatal error.
    ExceptionClose,
}

/// OS error texts that identify an abrupt remote close.
const REMOTE_CLOSE_PATTERNS: [&str; 5] = [
    "connection reset",
    "broken pipe",
    "forcibly closed",
    "connection aborted",
    "software caused connection abort",
];

impl DisconnectReason {
    /// Classifies a fatal I/O error into a disconnect reason.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => return DisconnectReason::RemoteCloseByException,
            io::ErrorKind::WriteZero => return DisconnectReason::RemoteClose,
            _ => {}
        }

        let message = err.to_string().to_ascii_lowercase();
        if REMOTE_CLOSE_PATTERNS.iter().any(|p| message.contains(p)) {
            DisconnectReason::RemoteCloseByException
        } else {
            DisconnectReason::ExceptionClose
        }
    }

    /// Returns `true` if the peer initiated the close.
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            DisconnectReason::RemoteClose | DisconnectReason::RemoteCloseByException
        )
    }

    /// Returns `true` if the exception callback must also observe the cause.
    pub(crate) fn reports_exception(self) -> bool {
        matches!(
            self,
            DisconnectReason::RemoteCloseByException | DisconnectReason::ExceptionClose
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::User => "user",
            DisconnectReason::RemoteClose => "remote close",
            DisconnectReason::RemoteCloseByException => "remote close by exception",
            DisconnectReason::ExceptionClose => "exception close",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_and_pipe_are_remote_by_exception() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = io::Error::from(kind);
            assert_eq!(
                DisconnectReason::classify(&err),
                DisconnectReason::RemoteCloseByException
            );
        }
    }

    #[test]
    fn message_patterns_are_matched() {
        let err = io::Error::other(
            "An existing connection was forcibly closed by the remote host",
        );
        assert_eq!(
            DisconnectReason::classify(&err),
            DisconnectReason::RemoteCloseByException
        );
    }

    #[test]
    fn write_zero_is_clean_remote_close() {
        let err = io::Error::from(io::ErrorKind::WriteZero);
        assert_eq!(DisconnectReason::classify(&err), DisconnectReason::RemoteClose);
    }

    #[test]
    fn unknown_errors_are_exception_close() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let reason = DisconnectReason::classify(&err);
        assert_eq!(reason, DisconnectReason::ExceptionClose);
        assert!(!reason.is_remote());
        assert!(reason.reports_exception());
    }
}
