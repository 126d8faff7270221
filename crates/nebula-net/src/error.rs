//! Error types shared by the socket engine, stream sockets, and framing layer.

use std::fmt;
use std::io;

/// Errors returned by socket operations.
///
/// `WouldBlock` never reaches callers of the stream or framing layers; it is
/// absorbed by the engine and retried when the socket becomes ready again.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The operation would block; retry when the socket is ready.
    #[error("operation would block")]
    WouldBlock,

    /// The connection was closed by the peer or failed.
    #[error("connection broken")]
    ConnectionBroken,

    /// A read (or write) was requested while another one is still active.
    #[error("another operation is already in progress in this direction")]
    ConflictingOperationInProgress,

    /// The requested protocol cannot back a stream socket.
    #[error("invalid protocol")]
    InvalidProtocol,

    /// The local port is already bound by another socket.
    #[error("port already in use")]
    PortInUse,

    /// The address or port cannot be bound.
    #[error("invalid port")]
    InvalidPort,

    /// Name resolution produced no usable address.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// The socket is not in a state that allows this operation.
    #[error("socket not connected")]
    NotConnected,

    /// The socket was already connected, bound, or handed to another layer.
    #[error("socket already in use")]
    AlreadyConnected,

    /// The socket id does not refer to a live socket.
    #[error("unknown socket")]
    UnknownSocket,

    /// Unclassified OS error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Map an OS error from a bind attempt to the configuration taxonomy.
    pub(crate) fn from_bind(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => NetError::PortInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::PermissionDenied => {
                NetError::InvalidPort
            }
            _ => NetError::Io(err),
        }
    }

    /// Whether this error ends the connection it was raised on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetError::ConnectionBroken | NetError::Io(_))
    }
}

/// Why a socket was closed. Delivered exactly once per socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side (`shutdown`/`close`).
    Local,
    /// The peer closed the connection cleanly.
    PeerClosed,
    /// The pending connect failed.
    ConnectFailed(String),
    /// The connection failed with an OS error.
    Error(String),
}

impl CloseReason {
    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => CloseReason::PeerClosed,
            _ => CloseReason::Error(err.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerClosed => write!(f, "connection closed by peer"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            CloseReason::Error(e) => write!(f, "connection error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_errors_map_to_config_taxonomy() {
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert!(matches!(NetError::from_bind(in_use), NetError::PortInUse));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(NetError::from_bind(denied), NetError::InvalidPort));

        let other = io::Error::from(io::ErrorKind::Other);
        assert!(matches!(NetError::from_bind(other), NetError::Io(_)));
    }

    #[test]
    fn test_close_reason_is_human_readable() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "connection closed by peer");
        let reason = CloseReason::from_io(&io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reason, CloseReason::PeerClosed);
        assert!(
            CloseReason::ConnectFailed("refused".into())
                .to_string()
                .contains("refused")
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(NetError::ConnectionBroken.is_fatal());
        assert!(!NetError::WouldBlock.is_fatal());
        assert!(!NetError::ConflictingOperationInProgress.is_fatal());
    }
}
