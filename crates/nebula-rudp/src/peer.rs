//! One remote endpoint of a [`Host`](crate::Host).
//!
//! A peer owns its channels, its outgoing command queues and the timing state
//! used for retransmission: RTT mean and variance, the packet throttle, the
//! packet-loss estimate, and a bandwidth window. The host drives it; nothing
//! here touches the socket.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tracing::trace;

use crate::channel::Channel;
use crate::error::DisconnectCause;
use crate::protocol::{
    CONTROL_CHANNEL, Command, ConnectParams, DATAGRAM_OVERHEAD, DEFAULT_MTU, Datagram, Envelope,
    Header, NO_PEER,
};
use crate::throttle::{BandwidthWindow, PACKET_THROTTLE_SCALE, PacketThrottle, ThrottleConfig};

/// RTT assumed before the first sample.
pub(crate) const DEFAULT_ROUND_TRIP_TIME: u32 = 500;

/// Retransmission timeouts never go below this, in milliseconds.
pub(crate) const MIN_RETRANSMIT_TIMEOUT: u32 = 50;

/// How often the packet-loss estimate is recomputed, in milliseconds.
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;

/// Fixed-point scale of the packet-loss estimate.
pub(crate) const PACKET_LOSS_SCALE: u32 = 1 << 16;

/// Bytes of reliable data allowed in flight at full throttle.
const MAX_RELIABLE_WINDOW: usize = 64 * 1024;

/// Connection state. See the crate docs for the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Disconnected,
    /// `connect` was called; waiting for the remote's `VerifyConnect`.
    Connecting,
    /// A `Connect` arrived; waiting for our `VerifyConnect` to be acknowledged.
    AcknowledgingConnect,
    Connected,
    /// Disconnect requested; waiting for queued reliable data to drain.
    DisconnectLater,
    /// Our `Disconnect` is in flight.
    Disconnecting,
    /// The remote's `Disconnect` arrived; sending its acknowledgement.
    AcknowledgingDisconnect,
    /// Gone; collected by the next `service` call.
    Zombie,
}

impl PeerState {
    /// States in which packets may be exchanged.
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }
}

/// Handle to a peer slot. Stale once the slot is reset for another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    index: u16,
    generation: u32,
}

impl PeerId {
    /// Slot index on the owning host.
    pub fn index(self) -> u16 {
        self.index
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}.{}", self.index, self.generation)
    }
}

/// RTT mean and mean deviation, updated with gains 1/8 and 1/4.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RoundTrip {
    mean: u32,
    variance: u32,
    sampled: bool,
}

impl Default for RoundTrip {
    fn default() -> Self {
        Self {
            mean: DEFAULT_ROUND_TRIP_TIME,
            variance: 0,
            sampled: false,
        }
    }
}

impl RoundTrip {
    pub(crate) fn update(&mut self, sample: u32) {
        if !self.sampled {
            self.mean = sample;
            self.variance = sample / 2;
            self.sampled = true;
            return;
        }
        let diff = i64::from(sample) - i64::from(self.mean);
        self.mean = (i64::from(self.mean) + diff / 8).max(0) as u32;
        let variance = i64::from(self.variance);
        self.variance = (variance + (diff.abs() - variance) / 4).max(0) as u32;
    }

    pub(crate) fn mean(&self) -> u32 {
        self.mean
    }

    pub(crate) fn variance(&self) -> u32 {
        self.variance
    }

    /// `mean + 4 * variance`, floored at [`MIN_RETRANSMIT_TIMEOUT`].
    pub(crate) fn retransmit_timeout(&self) -> u32 {
        self.mean
            .saturating_add(self.variance.saturating_mul(4))
            .max(MIN_RETRANSMIT_TIMEOUT)
    }
}

/// Packet-loss estimate over [`PACKET_LOSS_INTERVAL`] windows.
#[derive(Debug, Clone, Default)]
pub(crate) struct PacketLoss {
    sent: u32,
    lost: u32,
    epoch: u32,
    mean: u32,
    variance: u32,
}

impl PacketLoss {
    pub(crate) fn update(&mut self, now: u32) {
        if now.wrapping_sub(self.epoch) < PACKET_LOSS_INTERVAL {
            return;
        }
        self.epoch = now;
        if self.sent == 0 {
            return;
        }
        let estimate = (u64::from(self.lost) * u64::from(PACKET_LOSS_SCALE) / u64::from(self.sent))
            .min(u64::from(PACKET_LOSS_SCALE)) as u32;
        self.variance = (self.variance * 3 + estimate.abs_diff(self.mean)) / 4;
        self.mean = (self.mean * 7 + estimate) / 8;
        self.sent = 0;
        self.lost = 0;
    }
}

/// Timeout limits for unacknowledged reliable commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timeouts {
    /// Retransmission stops doubling once the timeout reaches
    /// `limit * initial timeout`; after `minimum` ms the peer then times out.
    pub limit: u32,
    pub minimum: u32,
    /// Unconditional timeout after this many ms without an acknowledgement.
    pub maximum: u32,
}

/// A reliable command queued or in flight.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub envelope: Envelope,
    pub size: usize,
    pub sent_time: u32,
    pub timeout: u32,
    pub timeout_limit: u32,
    pub attempts: u32,
}

pub struct Peer {
    index: u16,
    generation: u32,
    pub(crate) state: PeerState,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) remote_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) channels: Vec<Channel>,
    control_sequence: u32,
    pub(crate) mtu: u16,
    /// Bandwidth the remote declared, in bytes per second (0 = unlimited).
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) send_window: BandwidthWindow,
    pub(crate) round_trip: RoundTrip,
    pub(crate) throttle: PacketThrottle,
    pub(crate) loss: PacketLoss,
    pub(crate) timeouts: Timeouts,
    outgoing_reliable: VecDeque<Outgoing>,
    outgoing_unreliable: VecDeque<Envelope>,
    sent_reliable: Vec<Outgoing>,
    reliable_in_flight: usize,
    acknowledgements: VecDeque<Envelope>,
    earliest_timeout: Option<u32>,
    pub(crate) last_receive_time: u32,
    /// Data carried by the pending Connect/Disconnect event.
    pub(crate) event_data: u32,
    pub(crate) cause: Option<DisconnectCause>,
    /// Whether the application knows about this peer and must be told when
    /// it goes away.
    pub(crate) announced: bool,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("address", &self.address)
            .field("rtt", &self.round_trip.mean())
            .field("queued", &self.outgoing_reliable.len())
            .field("in_flight", &self.sent_reliable.len())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(index: u16, timeouts: Timeouts, throttle: ThrottleConfig) -> Self {
        Self {
            index,
            generation: 0,
            state: PeerState::Disconnected,
            address: None,
            remote_peer_id: NO_PEER,
            connect_id: 0,
            channels: Vec::new(),
            control_sequence: 0,
            mtu: DEFAULT_MTU,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            send_window: BandwidthWindow::default(),
            round_trip: RoundTrip::default(),
            throttle: PacketThrottle::new(throttle, DEFAULT_ROUND_TRIP_TIME),
            loss: PacketLoss::default(),
            timeouts,
            outgoing_reliable: VecDeque::new(),
            outgoing_unreliable: VecDeque::new(),
            sent_reliable: Vec::new(),
            reliable_in_flight: 0,
            acknowledgements: VecDeque::new(),
            earliest_timeout: None,
            last_receive_time: 0,
            event_data: 0,
            cause: None,
            announced: false,
        }
    }

    /// Return the slot to `Disconnected`, invalidating outstanding ids.
    pub(crate) fn reset(&mut self, timeouts: Timeouts, throttle: ThrottleConfig) {
        let generation = self.generation.wrapping_add(1);
        *self = Peer::new(self.index, timeouts, throttle);
        self.generation = generation;
    }

    pub fn id(&self) -> PeerId {
        PeerId {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Smoothed round-trip time.
    pub fn round_trip_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.round_trip.mean()))
    }

    pub fn round_trip_time_variance(&self) -> Duration {
        Duration::from_millis(u64::from(self.round_trip.variance()))
    }

    /// Fraction of reliable commands retransmitted, smoothed over
    /// [`PACKET_LOSS_INTERVAL`] windows.
    pub fn packet_loss(&self) -> f32 {
        self.loss.mean as f32 / PACKET_LOSS_SCALE as f32
    }

    /// Current packet throttle out of [`PACKET_THROTTLE_SCALE`].
    pub fn packet_throttle(&self) -> u32 {
        self.throttle.value()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Commands queued or awaiting acknowledgement.
    pub fn pending_reliable(&self) -> usize {
        self.outgoing_reliable.len() + self.sent_reliable.len()
    }

    pub(crate) fn matches(&self, id: PeerId) -> bool {
        self.generation == id.generation && self.state != PeerState::Disconnected
    }

    /// Whether nothing is queued or awaiting acknowledgement.
    pub(crate) fn is_idle(&self) -> bool {
        self.outgoing_reliable.is_empty()
            && self.outgoing_unreliable.is_empty()
            && self.sent_reliable.is_empty()
    }

    pub(crate) fn has_acknowledgements(&self) -> bool {
        !self.acknowledgements.is_empty()
    }

    pub(crate) fn local_params(
        &self,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> ConnectParams {
        let throttle = self.throttle.config();
        ConnectParams {
            peer_id: self.index,
            channel_count: u8::try_from(self.channels.len()).unwrap_or(u8::MAX),
            mtu: self.mtu,
            incoming_bandwidth,
            outgoing_bandwidth,
            throttle_interval: throttle.interval_ms(),
            throttle_acceleration: throttle.acceleration,
            throttle_deceleration: throttle.deceleration,
        }
    }

    /// Adopt the parameters the remote sent in `Connect`/`VerifyConnect`.
    pub(crate) fn apply_remote_params(&mut self, params: &ConnectParams, channel_limit: usize) {
        self.remote_peer_id = params.peer_id;
        let channels = usize::from(params.channel_count).clamp(1, channel_limit);
        self.channels.truncate(channels);
        self.channels.resize_with(channels, Channel::default);
        self.mtu = self.mtu.min(params.mtu).max(crate::protocol::MIN_MTU);
        self.incoming_bandwidth = params.incoming_bandwidth;
        self.outgoing_bandwidth = params.outgoing_bandwidth;
        self.throttle.configure(ThrottleConfig {
            interval: Duration::from_millis(u64::from(params.throttle_interval)),
            acceleration: params.throttle_acceleration,
            deceleration: params.throttle_deceleration,
        });
    }

    /// Queue a reliable command. Data channels number it in their own
    /// sequence; control commands share the control sequence.
    pub(crate) fn queue_reliable(&mut self, channel: u8, command: Command) {
        let reliable_sequence = if channel == CONTROL_CHANNEL {
            self.control_sequence = self.control_sequence.wrapping_add(1);
            self.control_sequence
        } else {
            self.channels[usize::from(channel)].next_reliable()
        };
        let envelope = Envelope {
            channel,
            reliable_sequence,
            acknowledge: true,
            command,
        };
        self.outgoing_reliable.push_back(Outgoing {
            size: envelope.encoded_len_bound(),
            envelope,
            sent_time: 0,
            timeout: 0,
            timeout_limit: 0,
            attempts: 0,
        });
    }

    pub(crate) fn queue_unreliable(&mut self, channel: u8, data: Vec<u8>) {
        let (reliable_sequence, unreliable_sequence) =
            self.channels[usize::from(channel)].next_unreliable();
        self.outgoing_unreliable.push_back(Envelope {
            channel,
            reliable_sequence,
            acknowledge: false,
            command: Command::SendUnreliable {
                unreliable_sequence,
                data,
            },
        });
    }

    pub(crate) fn queue_acknowledgement(&mut self, channel: u8, reliable_sequence: u32, sent_time: u32) {
        self.acknowledgements.push_back(Envelope {
            channel,
            reliable_sequence: 0,
            acknowledge: false,
            command: Command::Acknowledge {
                reliable_sequence,
                sent_time,
            },
        });
    }

    /// Drop everything queued or in flight, keeping pending acknowledgements.
    pub(crate) fn clear_outgoing(&mut self) {
        self.outgoing_reliable.clear();
        self.outgoing_unreliable.clear();
        self.sent_reliable.clear();
        self.reliable_in_flight = 0;
        self.earliest_timeout = None;
    }

    /// Queue a ping if the link has been quiet for `interval` ms and nothing
    /// reliable is pending.
    pub(crate) fn ping_if_idle(&mut self, now: u32, interval: u32) {
        if self.state == PeerState::Connected
            && self.outgoing_reliable.is_empty()
            && self.sent_reliable.is_empty()
            && now.wrapping_sub(self.last_receive_time) >= interval
        {
            self.queue_reliable(CONTROL_CHANNEL, Command::Ping);
        }
    }

    /// Process an acknowledgement and return the acknowledged command.
    pub(crate) fn acknowledge(&mut self, now: u32, channel: u8, sequence: u32, sent_time: u32) -> Option<Command> {
        let sample = now.wrapping_sub(sent_time);
        if (sample as i32) >= 0 {
            self.throttle.observe(sample);
            self.round_trip.update(sample);
            self.throttle
                .advance(now, self.round_trip.mean(), self.round_trip.variance());
        }

        let matches = |out: &Outgoing| {
            out.envelope.channel == channel && out.envelope.reliable_sequence == sequence
        };
        let acked = if let Some(position) = self.sent_reliable.iter().position(matches) {
            let out = self.sent_reliable.remove(position);
            self.reliable_in_flight = self.reliable_in_flight.saturating_sub(out.size);
            Some(out)
        } else {
            // Acknowledged while queued for retransmission.
            let position = self.outgoing_reliable.iter().position(|out| out.attempts > 0 && matches(out))?;
            self.outgoing_reliable.remove(position)
        };
        if self.sent_reliable.is_empty() {
            self.earliest_timeout = None;
        }
        acked.map(|out| out.envelope.command)
    }

    /// Requeue reliable commands whose retransmission timeout has expired.
    /// Returns `true` if the peer has exceeded its timeout limits instead.
    pub(crate) fn check_timeouts(&mut self, now: u32) -> bool {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.sent_reliable.len() {
            let sent = &self.sent_reliable[index];
            if now.wrapping_sub(sent.sent_time) < sent.timeout {
                index += 1;
                continue;
            }
            let earliest = match self.earliest_timeout {
                Some(earliest) if !crate::channel::sequence_after(earliest, sent.sent_time) => earliest,
                _ => sent.sent_time,
            };
            self.earliest_timeout = Some(earliest);
            let elapsed = now.wrapping_sub(earliest);
            if elapsed >= self.timeouts.maximum
                || (sent.timeout >= sent.timeout_limit && elapsed >= self.timeouts.minimum)
            {
                return true;
            }

            let mut sent = self.sent_reliable.remove(index);
            self.reliable_in_flight = self.reliable_in_flight.saturating_sub(sent.size);
            self.loss.lost += 1;
            sent.timeout = sent.timeout.saturating_mul(2);
            sent.attempts += 1;
            trace!(
                peer = %self.id(),
                channel = sent.envelope.channel,
                sequence = sent.envelope.reliable_sequence,
                attempts = sent.attempts,
                "retransmitting"
            );
            expired.push(sent);
        }
        for sent in expired.into_iter().rev() {
            self.outgoing_reliable.push_front(sent);
        }
        false
    }

    fn reliable_window(&self) -> usize {
        let window = MAX_RELIABLE_WINDOW * self.throttle.value() as usize / PACKET_THROTTLE_SCALE as usize;
        window.max(usize::from(self.mtu))
    }

    /// Pack acknowledgements, reliable and unreliable commands into one
    /// datagram of at most `mtu` bytes. `None` when there is nothing to send.
    pub(crate) fn build_datagram(&mut self, now: u32, rng: &mut impl Rng) -> Option<Datagram> {
        let budget = usize::from(self.mtu);
        let mut size = DATAGRAM_OVERHEAD;
        let mut envelopes = Vec::new();

        while let Some(ack) = self.acknowledgements.front() {
            let len = ack.encoded_len_bound();
            if size + len > budget {
                break;
            }
            size += len;
            envelopes.extend(self.acknowledgements.pop_front());
        }

        let window = self.reliable_window();
        while let Some(front) = self.outgoing_reliable.front() {
            if size + front.size > budget {
                break;
            }
            if !self.sent_reliable.is_empty() && self.reliable_in_flight + front.size > window {
                break;
            }
            if !self.send_window.try_consume(now, front.size) {
                break;
            }
            let Some(mut out) = self.outgoing_reliable.pop_front() else {
                break;
            };
            size += out.size;
            if out.attempts == 0 {
                out.timeout = self.round_trip.retransmit_timeout();
                out.timeout_limit = out.timeout.saturating_mul(self.timeouts.limit);
            }
            out.sent_time = now;
            self.reliable_in_flight += out.size;
            self.loss.sent += 1;
            envelopes.push(out.envelope.clone());
            self.sent_reliable.push(out);
        }

        while let Some(front) = self.outgoing_unreliable.front() {
            let len = front.encoded_len_bound();
            if size + len > budget {
                break;
            }
            let Some(envelope) = self.outgoing_unreliable.pop_front() else {
                break;
            };
            let roll = rng.random_range(0..PACKET_THROTTLE_SCALE);
            if !self.throttle.admits(roll) || !self.send_window.try_consume(now, len) {
                trace!(peer = %self.id(), channel = envelope.channel, "dropped unreliable packet");
                continue;
            }
            size += len;
            envelopes.push(envelope);
        }

        if envelopes.is_empty() {
            return None;
        }
        Some(Datagram {
            header: Header {
                peer_id: self.remote_peer_id,
                connect_id: self.connect_id,
                sent_time: now,
            },
            envelopes,
        })
    }
}
