use std::io;

use thiserror::Error;

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors surfaced through `*_error` callbacks and `Result` returns.
///
/// Socket errors are captured as [`ErrorKind::Io`] with the originating
/// `io::ErrorKind` preserved for classification. The enum is `Clone` so that
/// asynchronous callback dispatches can own their arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity is not connected (or no longer healthy).
    #[error("not connected")]
    NotConnected,
    /// Lookup by id or endpoint found no matching connection.
    #[error("no such connection")]
    NotFound,
    /// A send of zero bytes was requested.
    #[error("cannot send an empty buffer")]
    EmptySend,
    /// A send larger than the backing buffer was requested.
    #[error("send of {requested} bytes exceeds buffer of {available} bytes")]
    OversizedSend {
        /// Bytes the caller asked to send.
        requested: usize,
        /// Length of the buffer backing the send.
        available: usize,
    },
    /// A port string failed to parse or was out of range.
    #[error("invalid port: {0}")]
    InvalidPort(String),
    /// Host resolution produced no usable endpoint.
    #[error("could not resolve {0}")]
    ResolveFailed(String),
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An operating-system level socket error.
    #[error("{message}")]
    Io {
        /// The `io::ErrorKind` reported by the socket operation.
        kind: io::ErrorKind,
        /// Human-readable description of the failure.
        message: String,
    },
}

impl From<io::Error> for ErrorKind {
    fn from(error: io::Error) -> Self {
        ErrorKind::Io { kind: error.kind(), message: error.to_string() }
    }
}

/// How badly an error damages the entity that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed but the owning loop keeps going.
    Transient,
    /// The peer or this endpoint's socket is unusable; the connection must
    /// be torn down.
    ConnectionFatal,
    /// The server's own resources are broken; its I/O loop must exit.
    ServerFatal,
}

impl ErrorKind {
    /// Classifies this error into the three-tier severity taxonomy.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::NotConnected => Severity::ConnectionFatal,
            ErrorKind::Io { kind, .. } => classify_io(*kind),
            _ => Severity::Transient,
        }
    }

    /// True for any error a client must treat as fatal to itself. Clients
    /// have no server to escalate to, so both fatal tiers collapse into one.
    pub fn is_client_fatal(&self) -> bool {
        self.severity() != Severity::Transient
    }
}

/// Maps an `io::ErrorKind` onto the severity tiers.
///
/// Kinds with no stable `io::ErrorKind` representation fall through to
/// `Transient`; the owning loop retries and the error still reaches the
/// matching `*_error` callback.
pub fn classify_io(kind: io::ErrorKind) -> Severity {
    use io::ErrorKind::*;
    match kind {
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
        | ConnectionRefused | NotFound => Severity::ConnectionFatal,
        HostUnreachable | NetworkDown | NetworkUnreachable | OutOfMemory | TimedOut
        | Unsupported => Severity::ServerFatal,
        _ => Severity::Transient,
    }
}

/// True when an error only means "nothing happened this poll quantum".
///
/// Reads use a socket timeout equal to the poll interval, so these kinds are
/// pacing, not failures, and must be filtered before classification.
pub fn is_quantum_idle(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_fatal_kinds() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionRefused,
        ] {
            assert_eq!(classify_io(kind), Severity::ConnectionFatal, "{:?}", kind);
        }
    }

    #[test]
    fn server_fatal_kinds() {
        for kind in [
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::NetworkDown,
            io::ErrorKind::NetworkUnreachable,
            io::ErrorKind::OutOfMemory,
            io::ErrorKind::TimedOut,
        ] {
            assert_eq!(classify_io(kind), Severity::ServerFatal, "{:?}", kind);
        }
    }

    #[test]
    fn everything_else_is_transient() {
        assert_eq!(classify_io(io::ErrorKind::InvalidInput), Severity::Transient);
        assert_eq!(classify_io(io::ErrorKind::PermissionDenied), Severity::Transient);
    }

    #[test]
    fn synthetic_kinds_classify() {
        assert_eq!(ErrorKind::NotConnected.severity(), Severity::ConnectionFatal);
        assert_eq!(ErrorKind::EmptySend.severity(), Severity::Transient);
        assert_eq!(
            ErrorKind::OversizedSend { requested: 10, available: 5 }.severity(),
            Severity::Transient
        );
        assert_eq!(ErrorKind::NotFound.severity(), Severity::Transient);
    }

    #[test]
    fn io_errors_preserve_kind() {
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let kind = ErrorKind::from(error);
        assert_eq!(kind.severity(), Severity::ConnectionFatal);
    }

    #[test]
    fn quantum_idle_filter() {
        assert!(is_quantum_idle(&io::Error::new(io::ErrorKind::WouldBlock, "")));
        assert!(is_quantum_idle(&io::Error::new(io::ErrorKind::TimedOut, "")));
        assert!(!is_quantum_idle(&io::Error::new(io::ErrorKind::ConnectionReset, "")));
    }
}
