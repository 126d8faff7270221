//! Reliable UDP for the engine: a host owning a fixed set of peers, each
//! with numbered channels that carry reliable (ordered, retransmitted) and
//! unreliable (sequenced, droppable) packets.
//!
//! Everything runs on the thread calling [`Host::service`]; there is no
//! background thread.

mod channel;
pub mod compression;
pub mod error;
pub mod host;
pub mod peer;
pub mod protocol;
pub mod throttle;

pub use error::{DisconnectCause, HostError};
pub use host::{Delivery, Event, Host, HostConfig, HostStats, Packet};
pub use peer::{PACKET_LOSS_INTERVAL, Peer, PeerId, PeerState};
pub use protocol::{CONTROL_CHANNEL, DEFAULT_MTU, MAX_MTU, MAX_PACKET_SIZE, MIN_MTU};
pub use throttle::{PACKET_THROTTLE_SCALE, ThrottleConfig};
