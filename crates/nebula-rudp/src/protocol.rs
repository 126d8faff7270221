//! Datagram layout.
//!
//! A datagram is a [`Header`] followed by a list of [`Envelope`]s, each
//! carrying one [`Command`] for one channel. On the wire:
//! `[compression flag] [version] [postcard-encoded Datagram]`.
//!
//! The send path packs envelopes against a size bound computed from the
//! worst-case varint widths, so a packed datagram never exceeds the MTU
//! regardless of the actual field values.

use serde::{Deserialize, Serialize};

use crate::compression::{self, CompressionConfig, CompressionError};

/// Current datagram format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header `peer_id` used before the remote has assigned us a slot.
pub const NO_PEER: u16 = u16::MAX;

/// Channel id used by connection-management commands.
pub const CONTROL_CHANNEL: u8 = 0xFF;

/// Highest number of application channels per peer (`0..=254`).
pub const MAX_CHANNELS: usize = 255;

/// Highest number of peer slots a host may have.
pub const MAX_PEERS: usize = 0x0FFF;

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 4096;
pub const DEFAULT_MTU: u16 = 1400;

/// Largest packet accepted by `send`, after fragmentation.
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

/// Largest number of fragments one packet may be split into.
pub const MAX_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Worst-case bytes around the envelope list: flag, version, header, and
/// the list length.
pub(crate) const DATAGRAM_OVERHEAD: usize = 1 + 1 + (3 + 5 + 5) + 3;

/// Worst-case bytes of an envelope excluding its command fields: channel,
/// sequence, acknowledge flag, command tag.
pub(crate) const ENVELOPE_OVERHEAD: usize = 1 + 5 + 1 + 1;

const VARINT_U16: usize = 3;
const VARINT_U32: usize = 5;
const CONNECT_PARAMS_LEN: usize = VARINT_U16 + 1 + VARINT_U16 + 5 * VARINT_U32;

/// Sent with every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// The receiver's slot index for the sending peer, or [`NO_PEER`].
    pub peer_id: u16,
    /// Random id chosen by the connecting side. Datagrams from an older
    /// connection on the same slot carry a different id and are dropped.
    pub connect_id: u32,
    /// Sender's clock in milliseconds, echoed back by acknowledgements.
    pub sent_time: u32,
}

/// Connection parameters exchanged by `Connect` and `VerifyConnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Sender's slot index for the receiver.
    pub peer_id: u16,
    pub channel_count: u8,
    pub mtu: u16,
    /// Bytes per second the sender is willing to receive (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Bytes per second the sender intends to send (0 = unlimited).
    pub outgoing_bandwidth: u32,
    pub throttle_interval: u32,
    pub throttle_acceleration: u32,
    pub throttle_deceleration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Connect {
        params: ConnectParams,
        connect_id: u32,
        data: u32,
    },
    VerifyConnect {
        params: ConnectParams,
        connect_id: u32,
    },
    Disconnect {
        data: u32,
    },
    Ping,
    Acknowledge {
        reliable_sequence: u32,
        sent_time: u32,
    },
    SendReliable {
        data: Vec<u8>,
    },
    SendUnreliable {
        unreliable_sequence: u32,
        data: Vec<u8>,
    },
    SendFragment {
        start_sequence: u32,
        fragment_number: u32,
        fragment_count: u32,
        total_length: u32,
        offset: u32,
        data: Vec<u8>,
    },
    BandwidthLimit {
        incoming: u32,
        outgoing: u32,
    },
    ThrottleConfigure {
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    },
}

impl Command {
    /// Upper bound on the postcard size of the command fields.
    pub(crate) fn encoded_len_bound(&self) -> usize {
        match self {
            Command::Connect { .. } => CONNECT_PARAMS_LEN + 2 * VARINT_U32,
            Command::VerifyConnect { .. } => CONNECT_PARAMS_LEN + VARINT_U32,
            Command::Disconnect { .. } => VARINT_U32,
            Command::Ping => 0,
            Command::Acknowledge { .. } => 2 * VARINT_U32,
            Command::SendReliable { data } => VARINT_U32 + data.len(),
            Command::SendUnreliable { data, .. } => 2 * VARINT_U32 + data.len(),
            Command::SendFragment { data, .. } => 6 * VARINT_U32 + data.len(),
            Command::BandwidthLimit { .. } => 2 * VARINT_U32,
            Command::ThrottleConfigure { .. } => 3 * VARINT_U32,
        }
    }

    /// Name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::VerifyConnect { .. } => "verify-connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Ping => "ping",
            Command::Acknowledge { .. } => "acknowledge",
            Command::SendReliable { .. } => "send-reliable",
            Command::SendUnreliable { .. } => "send-unreliable",
            Command::SendFragment { .. } => "send-fragment",
            Command::BandwidthLimit { .. } => "bandwidth-limit",
            Command::ThrottleConfigure { .. } => "throttle-configure",
        }
    }
}

/// One command addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: u8,
    /// For reliable commands, their own sequence number. For unreliable
    /// sends, the channel's latest reliable sequence at send time.
    pub reliable_sequence: u32,
    /// Whether the receiver must acknowledge this command.
    pub acknowledge: bool,
    pub command: Command,
}

impl Envelope {
    pub(crate) fn encoded_len_bound(&self) -> usize {
        ENVELOPE_OVERHEAD + self.command.encoded_len_bound()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    pub header: Header,
    pub envelopes: Vec<Envelope>,
}

/// Largest fragment body that fits in one datagram of `mtu` bytes.
pub(crate) fn fragment_capacity(mtu: u16) -> usize {
    usize::from(mtu) - DATAGRAM_OVERHEAD - ENVELOPE_OVERHEAD - 6 * VARINT_U32
}

/// Largest `SendReliable` body that fits in one datagram of `mtu` bytes.
pub(crate) fn reliable_capacity(mtu: u16) -> usize {
    usize::from(mtu) - DATAGRAM_OVERHEAD - ENVELOPE_OVERHEAD - VARINT_U32
}

/// Largest `SendUnreliable` body that fits in one datagram of `mtu` bytes.
pub(crate) fn unreliable_capacity(mtu: u16) -> usize {
    usize::from(mtu) - DATAGRAM_OVERHEAD - ENVELOPE_OVERHEAD - 2 * VARINT_U32
}

/// Errors from decoding a received datagram. Such datagrams are dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// Nothing after the compression flag.
    #[error("empty datagram body")]
    EmptyPayload,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Serialize a datagram, compressing it when `compression` allows.
pub fn encode_datagram(
    datagram: &Datagram,
    compression: &CompressionConfig,
) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(datagram)?;
    let mut versioned = Vec::with_capacity(1 + body.len());
    versioned.push(PROTOCOL_VERSION);
    versioned.extend_from_slice(&body);
    Ok(compression::compress_datagram(&versioned, compression))
}

/// Parse a received datagram.
pub fn decode_datagram(data: &[u8]) -> Result<Datagram, ProtocolError> {
    let body = compression::decompress_datagram(data, usize::from(MAX_MTU))?;
    let (&version, rest) = body.split_first().ok_or(ProtocolError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(rest)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            peer_id: u16::MAX - 1,
            channel_count: u8::MAX,
            mtu: u16::MAX,
            incoming_bandwidth: u32::MAX,
            outgoing_bandwidth: u32::MAX,
            throttle_interval: u32::MAX,
            throttle_acceleration: u32::MAX,
            throttle_deceleration: u32::MAX,
        }
    }

    fn header() -> Header {
        Header {
            peer_id: u16::MAX,
            connect_id: u32::MAX,
            sent_time: u32::MAX,
        }
    }

    fn worst_case_commands() -> Vec<Command> {
        let data = vec![0xAB; 1300];
        vec![
            Command::Connect {
                params: params(),
                connect_id: u32::MAX,
                data: u32::MAX,
            },
            Command::VerifyConnect {
                params: params(),
                connect_id: u32::MAX,
            },
            Command::Disconnect { data: u32::MAX },
            Command::Ping,
            Command::Acknowledge {
                reliable_sequence: u32::MAX,
                sent_time: u32::MAX,
            },
            Command::SendReliable { data: data.clone() },
            Command::SendUnreliable {
                unreliable_sequence: u32::MAX,
                data: data.clone(),
            },
            Command::SendFragment {
                start_sequence: u32::MAX,
                fragment_number: u32::MAX,
                fragment_count: u32::MAX,
                total_length: u32::MAX,
                offset: u32::MAX,
                data,
            },
            Command::BandwidthLimit {
                incoming: u32::MAX,
                outgoing: u32::MAX,
            },
            Command::ThrottleConfigure {
                interval: u32::MAX,
                acceleration: u32::MAX,
                deceleration: u32::MAX,
            },
        ]
    }

    #[test]
    fn test_size_bound_covers_worst_case_encoding() {
        let raw = CompressionConfig::default();
        for command in worst_case_commands() {
            let envelope = Envelope {
                channel: u8::MAX,
                reliable_sequence: u32::MAX,
                acknowledge: true,
                command,
            };
            let bound = DATAGRAM_OVERHEAD + envelope.encoded_len_bound();
            let name = envelope.command.name();
            let datagram = Datagram {
                header: header(),
                envelopes: vec![envelope],
            };
            let encoded = encode_datagram(&datagram, &raw).unwrap();
            assert!(
                encoded.len() <= bound,
                "{name}: encoded {} bytes, bound {bound}",
                encoded.len()
            );
        }
    }

    #[test]
    fn test_capacities_fill_the_mtu() {
        let raw = CompressionConfig::default();
        let mtu = DEFAULT_MTU;
        let datagram = Datagram {
            header: header(),
            envelopes: vec![Envelope {
                channel: 3,
                reliable_sequence: u32::MAX,
                acknowledge: true,
                command: Command::SendFragment {
                    start_sequence: u32::MAX,
                    fragment_number: u32::MAX,
                    fragment_count: u32::MAX,
                    total_length: u32::MAX,
                    offset: u32::MAX,
                    data: vec![7; fragment_capacity(mtu)],
                },
            }],
        };
        let encoded = encode_datagram(&datagram, &raw).unwrap();
        assert!(encoded.len() <= usize::from(mtu));
        assert!(reliable_capacity(mtu) > fragment_capacity(mtu));
        assert!(unreliable_capacity(mtu) > fragment_capacity(mtu));
    }

    #[test]
    fn test_datagram_round_trip_with_compression() {
        let compress = CompressionConfig {
            enabled: true,
            ..CompressionConfig::default()
        };
        let datagram = Datagram {
            header: Header {
                peer_id: 4,
                connect_id: 0xDEAD_BEEF,
                sent_time: 1234,
            },
            envelopes: vec![
                Envelope {
                    channel: 0,
                    reliable_sequence: 9,
                    acknowledge: true,
                    command: Command::SendReliable {
                        data: vec![0; 600],
                    },
                },
                Envelope {
                    channel: CONTROL_CHANNEL,
                    reliable_sequence: 0,
                    acknowledge: false,
                    command: Command::Acknowledge {
                        reliable_sequence: 3,
                        sent_time: 1200,
                    },
                },
            ],
        };
        let bytes = encode_datagram(&datagram, &compress).unwrap();
        assert_eq!(bytes[0], compression::COMPRESSION_FLAG_LZ4);
        assert_eq!(decode_datagram(&bytes).unwrap(), datagram);
    }

    #[test]
    fn test_rejects_bad_version_and_garbage() {
        assert!(matches!(
            decode_datagram(&[compression::COMPRESSION_FLAG_NONE, 99, 0]),
            Err(ProtocolError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            decode_datagram(&[compression::COMPRESSION_FLAG_NONE]),
            Err(ProtocolError::EmptyPayload)
        ));
        assert!(matches!(
            decode_datagram(&[compression::COMPRESSION_FLAG_NONE, PROTOCOL_VERSION, 1]),
            Err(ProtocolError::Postcard(_))
        ));
    }
}
