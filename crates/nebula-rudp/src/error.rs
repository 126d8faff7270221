//! Errors returned by [`Host`](crate::Host) calls and the reasons reported
//! with disconnect events.

use std::fmt;
use std::io;

/// Errors from host operations. Connection failures are not errors: they
/// arrive later as [`Event::Disconnect`](crate::Event::Disconnect).
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Every peer slot is in use.
    #[error("no available peer slots")]
    NoAvailablePeers,

    /// The peer id is stale or was never issued by this host.
    #[error("invalid peer")]
    InvalidPeer,

    /// The channel is outside the range negotiated with the peer.
    #[error("invalid channel {0}")]
    InvalidChannel(u8),

    /// The packet exceeds the largest size that can be fragmented.
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    /// The peer is not connected, so nothing can be sent to it.
    #[error("peer not connected")]
    NotConnected,

    /// The UDP socket could not be created or bound.
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] io::Error),

    /// Unexpected socket error while servicing the host.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a peer left. Reported once, with [`Event::Disconnect`](crate::Event::Disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCause {
    /// This side called `disconnect` and the remote acknowledged it.
    Local,
    /// The remote side disconnected.
    Remote,
    /// Reliable commands went unacknowledged past the peer's timeout limits.
    Timeout,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Local => f.write_str("disconnected locally"),
            DisconnectCause::Remote => f.write_str("disconnected by remote peer"),
            DisconnectCause::Timeout => f.write_str("timed out"),
        }
    }
}
