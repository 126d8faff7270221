//! Built-in message kinds.
//!
//! Kind bytes below `0x10` are reserved for transport housekeeping; gameplay
//! kinds start at `0x10`.

use std::any::Any;

use crate::net_message;
use crate::net_record;
use crate::schema::{CodecError, NetMessage, Writer};

/// Version sent in [`Hello`].
pub const PROTOCOL_VERSION: u16 = 1;

/// Control kind: closes the framing socket once everything queued before it
/// has been written. Never appears on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Close;

impl Close {
    pub const KIND: u8 = 0x01;
}

impl NetMessage for Close {
    fn kind(&self) -> u8 {
        Self::KIND
    }

    fn encoded_len(&self) -> usize {
        0
    }

    fn serialize(&self, w: &mut Writer<'_>) -> Result<usize, CodecError> {
        Ok(w.position())
    }

    fn is_control(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

net_message! {
    /// Keepalive probe; answered with [`Pong`] carrying the same nonce.
    pub struct Ping = 0x02 {
        int nonce: u32 = 4,
    }
}

net_message! {
    /// Reply to [`Ping`].
    pub struct Pong = 0x03 {
        int nonce: u32 = 4,
    }
}

net_message! {
    /// First message of a session: protocol version and display name.
    pub struct Hello = 0x04 {
        int protocol_version: u16 = 2,
        nested name: String,
    }
}

net_message! {
    /// Chat line relayed to every other session.
    pub struct Chat = 0x10 {
        int sender: u32 = 4,
        nested text: String,
    }
}

net_message! {
    /// Opaque game command for a simulation turn.
    pub struct Command = 0x20 {
        int turn: u32 = 4,
        int player: u8 = 1,
        array payload: u8,
    }
}

net_record! {
    /// One unit's position on the map.
    pub struct UnitPosition {
        int id: u32 = 3,
        int x: i16 = 2,
        int y: i16 = 2,
    }
}

net_message! {
    /// Positions of every unit that moved during a turn.
    pub struct UnitPositions = 0x21 {
        int turn: u32 = 4,
        array units: UnitPosition,
    }
}
