//! The UDP host: one socket, a fixed table of peers, and the service loop
//! that moves commands between them.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::channel::{FragmentInfo, Ready};
use crate::compression::CompressionConfig;
use crate::error::{DisconnectCause, HostError};
use crate::peer::{Peer, PeerId, PeerState, Timeouts};
use crate::protocol::{
    self, CONTROL_CHANNEL, Command, ConnectParams, DEFAULT_MTU, Datagram, Envelope, Header,
    MAX_CHANNELS, MAX_FRAGMENT_COUNT, MAX_MTU, MAX_PACKET_SIZE, MAX_PEERS, MIN_MTU, NO_PEER,
};
use crate::throttle::ThrottleConfig;

const SOCKET_TOKEN: Token = Token(0);
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Longest single wait inside `service`, so retransmission timers are
/// checked even when no datagrams arrive.
const SERVICE_TICK: Duration = Duration::from_millis(10);

/// How often per-peer bandwidth limits are recomputed, in milliseconds.
const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

/// Host construction parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of peer slots; bounds simultaneous connections.
    pub peer_count: usize,
    /// Most channels a connecting peer may open.
    pub channel_limit: usize,
    /// Bytes per second this host will receive (0 = unlimited). Announced to
    /// peers, which limit what they send.
    pub incoming_bandwidth: u32,
    /// Bytes per second this host will send, shared by connected peers
    /// (0 = unlimited).
    pub outgoing_bandwidth: u32,
    pub mtu: u16,
    /// Multiple of the initial retransmission timeout after which a peer
    /// that has also passed `timeout_minimum` is dropped.
    pub timeout_limit: u32,
    pub timeout_minimum: Duration,
    pub timeout_maximum: Duration,
    /// Idle time after which a connected peer is pinged.
    pub ping_interval: Duration,
    pub throttle: ThrottleConfig,
    /// LZ4-compress outgoing datagrams when it makes them smaller.
    pub compress: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: MAX_CHANNELS,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            timeout_limit: 32,
            timeout_minimum: Duration::from_secs(5),
            timeout_maximum: Duration::from_secs(30),
            ping_interval: Duration::from_millis(500),
            throttle: ThrottleConfig::default(),
            compress: false,
        }
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

impl HostConfig {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            limit: self.timeout_limit.max(1),
            minimum: millis(self.timeout_minimum),
            maximum: millis(self.timeout_maximum),
        }
    }
}

/// How a packet is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Retransmitted until acknowledged; delivered in order.
    Reliable,
    /// Sent once; may be dropped, never delivered out of order.
    Unreliable,
}

/// Application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    delivery: Delivery,
}

impl Packet {
    pub fn reliable(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            delivery: Delivery::Reliable,
        }
    }

    pub fn unreliable(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            delivery: Delivery::Unreliable,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn is_reliable(&self) -> bool {
        self.delivery == Delivery::Reliable
    }
}

/// Something that happened on the host. Returned one at a time by
/// [`Host::service`] and [`Host::check_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection completed, either one we started with `connect` or one
    /// a remote started. `data` is the value passed to the remote's `connect`.
    Connect { peer: PeerId, data: u32 },
    /// A connected peer (or one we were connecting to) is gone. The id is
    /// stale from now on.
    Disconnect {
        peer: PeerId,
        cause: DisconnectCause,
        data: u32,
    },
    Receive {
        peer: PeerId,
        channel: u8,
        packet: Packet,
    },
}

/// Datagram counters since the host was bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Received datagrams that were malformed, oversized or stale.
    pub datagrams_dropped: u64,
}

pub struct Host {
    socket: UdpSocket,
    poll: Poll,
    poll_events: Events,
    local_addr: SocketAddr,
    config: HostConfig,
    compression: CompressionConfig,
    peers: Vec<Peer>,
    events: VecDeque<Event>,
    epoch: Instant,
    bandwidth_epoch: u32,
    receive_buffer: Box<[u8]>,
    stats: HostStats,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .field("connected", &self.connected_peers().count())
            .field("queued_events", &self.events.len())
            .finish()
    }
}

fn open_socket(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(address),
        Type::DGRAM,
        Some(SockProtocol::UDP),
    )?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "could not enlarge UDP receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "could not enlarge UDP send buffer");
    }
    socket.bind(&address.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

impl Host {
    /// Bind a UDP socket and allocate `config.peer_count` peer slots.
    pub fn bind(address: SocketAddr, config: HostConfig) -> Result<Self, HostError> {
        let mut config = config;
        config.peer_count = config.peer_count.clamp(1, MAX_PEERS);
        config.channel_limit = config.channel_limit.clamp(1, MAX_CHANNELS);
        config.mtu = config.mtu.clamp(MIN_MTU, MAX_MTU);

        let mut socket = open_socket(address).map_err(HostError::Bind)?;
        let local_addr = socket.local_addr().map_err(HostError::Bind)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let timeouts = config.timeouts();
        let peers = (0..config.peer_count)
            .map(|index| Peer::new(index as u16, timeouts, config.throttle))
            .collect();
        let compression = CompressionConfig {
            enabled: config.compress,
            ..CompressionConfig::default()
        };
        info!(%local_addr, peers = config.peer_count, "UDP host bound");

        Ok(Self {
            socket,
            poll,
            poll_events: Events::with_capacity(16),
            local_addr,
            config,
            compression,
            peers,
            events: VecDeque::new(),
            epoch: Instant::now(),
            bandwidth_epoch: 0,
            receive_buffer: vec![0; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            stats: HostStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    /// Milliseconds since the host was bound. Wraps after about 49 days; all
    /// comparisons use wrapping arithmetic.
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn slot(&self, id: PeerId) -> Result<usize, HostError> {
        let index = usize::from(id.index());
        match self.peers.get(index) {
            Some(peer) if peer.matches(id) => Ok(index),
            _ => Err(HostError::InvalidPeer),
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.slot(id).ok().map(|index| &self.peers[index])
    }

    /// Ids of peers in a connected state.
    pub fn connected_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|peer| peer.state.is_connected())
            .map(Peer::id)
    }

    fn reset_peer(&mut self, index: usize) {
        let timeouts = self.config.timeouts();
        self.peers[index].reset(timeouts, self.config.throttle);
    }

    fn free_slot(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
    }

    /// Start connecting to `address`. The returned id is usable at once; an
    /// [`Event::Connect`] or [`Event::Disconnect`] for it follows.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, HostError> {
        let index = self.free_slot().ok_or(HostError::NoAvailablePeers)?;
        let now = self.now_ms();
        let channel_count = channel_count.clamp(1, self.config.channel_limit);
        let peer = &mut self.peers[index];
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = rand::random();
        peer.mtu = self.config.mtu;
        peer.channels.resize_with(channel_count, Default::default);
        peer.last_receive_time = now;
        peer.announced = true;
        let params = peer.local_params(self.config.incoming_bandwidth, self.config.outgoing_bandwidth);
        let connect_id = peer.connect_id;
        peer.queue_reliable(
            CONTROL_CHANNEL,
            Command::Connect {
                params,
                connect_id,
                data,
            },
        );
        debug!(peer = %peer.id(), %address, channels = channel_count, "connecting");
        Ok(peer.id())
    }

    /// Queue `packet` for `peer` on `channel`. Payloads that do not fit one
    /// datagram are split into reliable fragments.
    pub fn send(&mut self, id: PeerId, channel: u8, packet: Packet) -> Result<(), HostError> {
        let index = self.slot(id)?;
        self.queue_packet(index, channel, packet)
    }

    fn queue_packet(&mut self, index: usize, channel: u8, packet: Packet) -> Result<(), HostError> {
        let peer = &mut self.peers[index];
        if peer.state != PeerState::Connected {
            return Err(HostError::NotConnected);
        }
        if usize::from(channel) >= peer.channels.len() {
            return Err(HostError::InvalidChannel(channel));
        }
        let size = packet.data.len();
        if size > MAX_PACKET_SIZE {
            return Err(HostError::PacketTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }

        let capacity = match packet.delivery {
            Delivery::Reliable => protocol::reliable_capacity(peer.mtu),
            Delivery::Unreliable => protocol::unreliable_capacity(peer.mtu),
        };
        if size <= capacity {
            match packet.delivery {
                Delivery::Reliable => peer.queue_reliable(
                    channel,
                    Command::SendReliable { data: packet.data },
                ),
                Delivery::Unreliable => peer.queue_unreliable(channel, packet.data),
            }
            return Ok(());
        }

        let fragment_size = protocol::fragment_capacity(peer.mtu);
        let fragment_count = size.div_ceil(fragment_size);
        if fragment_count > MAX_FRAGMENT_COUNT as usize {
            return Err(HostError::PacketTooLarge {
                size,
                max: MAX_FRAGMENT_COUNT as usize * fragment_size,
            });
        }
        let start_sequence = peer.channels[usize::from(channel)].peek_reliable();
        for (number, chunk) in packet.data.chunks(fragment_size).enumerate() {
            peer.queue_reliable(
                channel,
                Command::SendFragment {
                    start_sequence,
                    fragment_number: number as u32,
                    fragment_count: fragment_count as u32,
                    total_length: size as u32,
                    offset: (number * fragment_size) as u32,
                    data: chunk.to_vec(),
                },
            );
        }
        trace!(peer = %peer.id(), channel, size, fragment_count, "fragmented packet");
        Ok(())
    }

    /// Queue `packet` for every connected peer that has `channel`.
    pub fn broadcast(&mut self, channel: u8, packet: Packet) {
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];
            if peer.state == PeerState::Connected && usize::from(channel) < peer.channels.len() {
                if let Err(e) = self.queue_packet(index, channel, packet.clone()) {
                    debug!(peer = %self.peers[index].id(), error = %e, "broadcast skipped peer");
                }
            }
        }
    }

    /// Ask the remote to disconnect. An [`Event::Disconnect`] with
    /// [`DisconnectCause::Local`] follows once it acknowledges.
    pub fn disconnect(&mut self, id: PeerId, data: u32) -> Result<(), HostError> {
        let index = self.slot(id)?;
        self.begin_disconnect(index, data);
        Ok(())
    }

    fn begin_disconnect(&mut self, index: usize, data: u32) {
        let peer = &mut self.peers[index];
        match peer.state {
            PeerState::Connected | PeerState::DisconnectLater => {
                peer.clear_outgoing();
                peer.event_data = data;
                peer.queue_reliable(CONTROL_CHANNEL, Command::Disconnect { data });
                peer.state = PeerState::Disconnecting;
                debug!(peer = %peer.id(), "disconnecting");
            }
            PeerState::Connecting | PeerState::AcknowledgingConnect => {
                self.disconnect_index_now(index, data);
            }
            _ => {}
        }
    }

    /// Disconnect once everything queued for the peer has been acknowledged.
    pub fn disconnect_later(&mut self, id: PeerId, data: u32) -> Result<(), HostError> {
        let index = self.slot(id)?;
        let peer = &mut self.peers[index];
        if peer.state == PeerState::Connected && !peer.is_idle() {
            peer.state = PeerState::DisconnectLater;
            peer.event_data = data;
        } else {
            self.begin_disconnect(index, data);
        }
        Ok(())
    }

    /// Tell the remote once, without waiting, and forget the peer. No
    /// event is generated.
    pub fn disconnect_now(&mut self, id: PeerId, data: u32) -> Result<(), HostError> {
        let index = self.slot(id)?;
        self.disconnect_index_now(index, data);
        Ok(())
    }

    fn disconnect_index_now(&mut self, index: usize, data: u32) {
        let peer = &self.peers[index];
        if !matches!(peer.state, PeerState::Zombie | PeerState::Disconnecting) {
            if let Some(address) = peer.address {
                let datagram = Datagram {
                    header: Header {
                        peer_id: peer.remote_peer_id,
                        connect_id: peer.connect_id,
                        sent_time: self.now_ms(),
                    },
                    envelopes: vec![Envelope {
                        channel: CONTROL_CHANNEL,
                        reliable_sequence: 0,
                        acknowledge: false,
                        command: Command::Disconnect { data },
                    }],
                };
                self.send_datagram(address, &datagram);
            }
        }
        debug!(peer = %self.peers[index].id(), "disconnected now");
        self.reset_peer(index);
    }

    /// Forget the peer without telling the remote. No event is generated.
    pub fn reset(&mut self, id: PeerId) -> Result<(), HostError> {
        let index = self.slot(id)?;
        self.reset_peer(index);
        Ok(())
    }

    /// Queue a ping, refreshing the RTT estimate.
    pub fn ping(&mut self, id: PeerId) -> Result<(), HostError> {
        let index = self.slot(id)?;
        let peer = &mut self.peers[index];
        if !peer.state.is_connected() {
            return Err(HostError::NotConnected);
        }
        peer.queue_reliable(CONTROL_CHANNEL, Command::Ping);
        Ok(())
    }

    /// Change the host's bandwidth limits and announce them to every
    /// connected peer.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.config.incoming_bandwidth = incoming;
        self.config.outgoing_bandwidth = outgoing;
        for peer in self.peers.iter_mut().filter(|peer| peer.state.is_connected()) {
            peer.queue_reliable(CONTROL_CHANNEL, Command::BandwidthLimit { incoming, outgoing });
        }
        self.recalculate_bandwidth();
    }

    pub fn set_compression(&mut self, enabled: bool) {
        self.config.compress = enabled;
        self.compression.enabled = enabled;
    }

    /// Override the timeout limits of one peer.
    pub fn set_timeout(
        &mut self,
        id: PeerId,
        limit: u32,
        minimum: Duration,
        maximum: Duration,
    ) -> Result<(), HostError> {
        let index = self.slot(id)?;
        self.peers[index].timeouts = Timeouts {
            limit: limit.max(1),
            minimum: millis(minimum),
            maximum: millis(maximum),
        };
        Ok(())
    }

    /// Change a peer's packet throttle and send the new values to the remote.
    pub fn configure_throttle(
        &mut self,
        id: PeerId,
        interval: Duration,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<(), HostError> {
        let index = self.slot(id)?;
        let peer = &mut self.peers[index];
        let config = ThrottleConfig {
            interval,
            acceleration,
            deceleration,
        };
        peer.throttle.configure(config);
        if peer.state.is_connected() {
            peer.queue_reliable(
                CONTROL_CHANNEL,
                Command::ThrottleConfigure {
                    interval: config.interval_ms(),
                    acceleration,
                    deceleration,
                },
            );
        }
        Ok(())
    }

    /// Send, receive and time out until an event is available or `timeout`
    /// has elapsed. Returns at most one event.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>, HostError> {
        if let Some(event) = self.dispatch() {
            return Ok(Some(event));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = self.now_ms();
            if now.wrapping_sub(self.bandwidth_epoch) >= BANDWIDTH_THROTTLE_INTERVAL {
                self.bandwidth_epoch = now;
                self.recalculate_bandwidth();
            }
            self.send_outgoing(now, true);
            self.receive_incoming()?;
            self.send_outgoing(self.now_ms(), false);
            if let Some(event) = self.dispatch() {
                return Ok(Some(event));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self
                .poll
                .poll(&mut self.poll_events, Some(remaining.min(SERVICE_TICK)))
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next queued event, without doing any I/O.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch()
    }

    /// Send everything queued now, without receiving.
    pub fn flush(&mut self) {
        let now = self.now_ms();
        self.send_outgoing(now, false);
    }

    fn dispatch(&mut self) -> Option<Event> {
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];
            if peer.state != PeerState::Zombie {
                continue;
            }
            if peer.announced {
                self.events.push_back(Event::Disconnect {
                    peer: peer.id(),
                    cause: peer.cause.unwrap_or(DisconnectCause::Remote),
                    data: peer.event_data,
                });
            }
            debug!(peer = %peer.id(), cause = ?peer.cause, "peer removed");
            self.reset_peer(index);
        }
        self.events.pop_front()
    }

    fn zombify(&mut self, index: usize, cause: DisconnectCause) {
        let peer = &mut self.peers[index];
        peer.state = PeerState::Zombie;
        peer.cause = Some(cause);
        if cause == DisconnectCause::Timeout {
            peer.event_data = 0;
            info!(peer = %peer.id(), address = ?peer.address, "peer timed out");
        }
    }

    fn recalculate_bandwidth(&mut self) {
        let connected = self
            .peers
            .iter()
            .filter(|peer| peer.state.is_connected())
            .count()
            .max(1) as u32;
        let share = self.config.outgoing_bandwidth / connected;
        for peer in &mut self.peers {
            let limit = match (share, peer.incoming_bandwidth) {
                (0, remote) => remote,
                (share, 0) => share,
                (share, remote) => share.min(remote),
            };
            peer.send_window.set_limit(limit);
        }
    }

    fn send_datagram(&mut self, address: SocketAddr, datagram: &Datagram) {
        let bytes = match protocol::encode_datagram(datagram, &self.compression) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode datagram");
                return;
            }
        };
        match self.socket.send_to(&bytes, address) {
            Ok(sent) => {
                self.stats.datagrams_sent += 1;
                self.stats.bytes_sent += sent as u64;
                trace!(%address, bytes = sent, commands = datagram.envelopes.len(), "sent datagram");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%address, "socket full, datagram dropped");
            }
            Err(e) => debug!(%address, error = %e, "send failed"),
        }
    }

    fn send_outgoing(&mut self, now: u32, check_timeouts: bool) {
        let ping_interval = millis(self.config.ping_interval);
        let mut rng = rand::rng();
        for index in 0..self.peers.len() {
            let state = self.peers[index].state;
            if matches!(state, PeerState::Disconnected | PeerState::Zombie) {
                continue;
            }
            if state == PeerState::DisconnectLater && self.peers[index].is_idle() {
                let data = self.peers[index].event_data;
                self.begin_disconnect(index, data);
            }
            if check_timeouts && self.peers[index].check_timeouts(now) {
                self.zombify(index, DisconnectCause::Timeout);
                continue;
            }

            let peer = &mut self.peers[index];
            peer.ping_if_idle(now, ping_interval);
            peer.loss.update(now);
            let Some(address) = peer.address else {
                continue;
            };
            while let Some(datagram) = self.peers[index].build_datagram(now, &mut rng) {
                self.send_datagram(address, &datagram);
            }

            let peer = &self.peers[index];
            if peer.state == PeerState::AcknowledgingDisconnect && !peer.has_acknowledgements() {
                self.zombify(index, DisconnectCause::Remote);
            }
        }
    }

    fn receive_incoming(&mut self) -> Result<(), HostError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.receive_buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.stats.datagrams_received += 1;
            self.stats.bytes_received += len as u64;
            if len > usize::from(MAX_MTU) {
                debug!(%from, len, "dropping oversized datagram");
                self.stats.datagrams_dropped += 1;
                continue;
            }
            let datagram = match protocol::decode_datagram(&self.receive_buffer[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!(%from, error = %e, "dropping malformed datagram");
                    self.stats.datagrams_dropped += 1;
                    continue;
                }
            };
            let now = self.now_ms();
            if !self.handle_datagram(now, from, datagram) {
                self.stats.datagrams_dropped += 1;
            }
        }
    }

    /// Returns `false` if the datagram was not for any live peer.
    fn handle_datagram(&mut self, now: u32, from: SocketAddr, datagram: Datagram) -> bool {
        let Datagram { header, envelopes } = datagram;
        let index = if header.peer_id == NO_PEER {
            match envelopes.first().map(|envelope| &envelope.command) {
                Some(Command::Connect {
                    params,
                    connect_id,
                    data,
                }) => match self.accept_connect(now, from, params, *connect_id, *data) {
                    Some(index) => index,
                    None => return false,
                },
                _ => return false,
            }
        } else {
            let index = usize::from(header.peer_id);
            match self.peers.get(index) {
                Some(peer)
                    if !matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                        && peer.address == Some(from)
                        && peer.connect_id == header.connect_id =>
                {
                    index
                }
                _ => {
                    trace!(%from, peer_id = header.peer_id, "datagram for unknown peer");
                    return false;
                }
            }
        };

        self.peers[index].last_receive_time = now;
        for envelope in envelopes {
            if matches!(self.peers[index].state, PeerState::Disconnected | PeerState::Zombie) {
                break;
            }
            self.handle_envelope(index, now, header.sent_time, envelope);
        }
        true
    }

    fn accept_connect(
        &mut self,
        now: u32,
        from: SocketAddr,
        params: &ConnectParams,
        connect_id: u32,
        data: u32,
    ) -> Option<usize> {
        if let Some(existing) = self.peers.iter().position(|peer| {
            peer.state != PeerState::Disconnected
                && peer.address == Some(from)
                && peer.connect_id == connect_id
        }) {
            return Some(existing);
        }
        let Some(index) = self.free_slot() else {
            debug!(%from, "connect refused, no free peer slot");
            return None;
        };
        let channel_limit = self.config.channel_limit;
        let (incoming, outgoing) = (self.config.incoming_bandwidth, self.config.outgoing_bandwidth);
        let peer = &mut self.peers[index];
        peer.state = PeerState::AcknowledgingConnect;
        peer.address = Some(from);
        peer.connect_id = connect_id;
        peer.mtu = self.config.mtu;
        peer.event_data = data;
        peer.last_receive_time = now;
        peer.apply_remote_params(params, channel_limit);
        let verify = peer.local_params(incoming, outgoing);
        peer.queue_reliable(
            CONTROL_CHANNEL,
            Command::VerifyConnect {
                params: verify,
                connect_id,
            },
        );
        debug!(peer = %peer.id(), %from, channels = peer.channel_count(), "incoming connection");
        Some(index)
    }

    fn handle_envelope(&mut self, index: usize, now: u32, sent_time: u32, envelope: Envelope) {
        let Envelope {
            channel,
            reliable_sequence,
            acknowledge,
            command,
        } = envelope;
        let peer = &mut self.peers[index];
        match command {
            Command::Acknowledge {
                reliable_sequence: acked,
                sent_time: echoed,
            } => self.handle_acknowledge(index, now, channel, acked, echoed),

            Command::SendReliable { .. } | Command::SendFragment { .. } => {
                if !peer.state.is_connected() {
                    return;
                }
                let Some(target) = peer.channels.get_mut(usize::from(channel)) else {
                    return;
                };
                if target.accept_reliable(reliable_sequence, command)
                    == crate::channel::Acceptance::OutOfWindow
                {
                    return;
                }
                let mut ready = Vec::new();
                target.drain_ready(&mut ready);
                peer.queue_acknowledgement(channel, reliable_sequence, sent_time);
                for item in ready {
                    self.deliver(index, channel, item);
                }
            }

            Command::SendUnreliable {
                unreliable_sequence,
                data,
            } => {
                if !peer.state.is_connected() {
                    return;
                }
                let Some(target) = peer.channels.get_mut(usize::from(channel)) else {
                    return;
                };
                if let Some(data) = target.accept_unreliable(reliable_sequence, unreliable_sequence, data) {
                    self.deliver(index, channel, Ready::Unreliable(data));
                }
            }

            control => {
                if acknowledge {
                    peer.queue_acknowledgement(channel, reliable_sequence, sent_time);
                }
                self.handle_control(index, control, acknowledge);
            }
        }
    }

    fn handle_control(&mut self, index: usize, command: Command, acknowledged: bool) {
        let channel_limit = self.config.channel_limit;
        let peer = &mut self.peers[index];
        match command {
            Command::VerifyConnect { params, connect_id } => {
                if peer.state != PeerState::Connecting || connect_id != peer.connect_id {
                    return;
                }
                peer.apply_remote_params(&params, channel_limit);
                peer.state = PeerState::Connected;
                info!(peer = %peer.id(), address = ?peer.address, "connected");
                self.events.push_back(Event::Connect {
                    peer: peer.id(),
                    data: 0,
                });
                self.recalculate_bandwidth();
            }
            Command::Disconnect { data } => self.handle_remote_disconnect(index, data, acknowledged),
            Command::BandwidthLimit { incoming, outgoing } => {
                peer.incoming_bandwidth = incoming;
                peer.outgoing_bandwidth = outgoing;
                self.recalculate_bandwidth();
            }
            Command::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            } => peer.throttle.configure(ThrottleConfig {
                interval: Duration::from_millis(u64::from(interval)),
                acceleration,
                deceleration,
            }),
            Command::Ping | Command::Connect { .. } => {}
            other => trace!(command = other.name(), "unexpected control command"),
        }
    }

    fn handle_remote_disconnect(&mut self, index: usize, data: u32, acknowledged: bool) {
        let peer = &mut self.peers[index];
        match peer.state {
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect => {}
            PeerState::Connected | PeerState::DisconnectLater | PeerState::Disconnecting
                if acknowledged =>
            {
                peer.clear_outgoing();
                peer.event_data = data;
                peer.state = PeerState::AcknowledgingDisconnect;
                debug!(peer = %peer.id(), "remote disconnecting");
            }
            _ => {
                peer.event_data = data;
                self.zombify(index, DisconnectCause::Remote);
            }
        }
    }

    fn handle_acknowledge(&mut self, index: usize, now: u32, channel: u8, sequence: u32, echoed: u32) {
        let peer = &mut self.peers[index];
        let Some(command) = peer.acknowledge(now, channel, sequence, echoed) else {
            return;
        };
        match command {
            Command::VerifyConnect { .. } if peer.state == PeerState::AcknowledgingConnect => {
                peer.state = PeerState::Connected;
                peer.announced = true;
                info!(peer = %peer.id(), address = ?peer.address, "connected");
                self.events.push_back(Event::Connect {
                    peer: peer.id(),
                    data: peer.event_data,
                });
                self.recalculate_bandwidth();
            }
            Command::Disconnect { .. } if peer.state == PeerState::Disconnecting => {
                self.zombify(index, DisconnectCause::Local);
            }
            _ => {}
        }
    }

    fn deliver(&mut self, index: usize, channel: u8, item: Ready) {
        let peer = &mut self.peers[index];
        let packet = match item {
            Ready::Unreliable(data) => Packet::unreliable(data),
            Ready::Reliable(Command::SendReliable { data }) => Packet::reliable(data),
            Ready::Reliable(Command::SendFragment {
                start_sequence,
                fragment_number,
                fragment_count,
                total_length,
                offset,
                data,
            }) => {
                let info = FragmentInfo {
                    start_sequence,
                    fragment_number,
                    fragment_count,
                    total_length,
                    offset,
                };
                match peer.channels[usize::from(channel)].reassemble(info, &data) {
                    Ok(Some(whole)) => Packet::reliable(whole),
                    Ok(None) => return,
                    Err(e) => {
                        debug!(peer = %peer.id(), channel, error = %e, "dropping fragmented packet");
                        return;
                    }
                }
            }
            Ready::Reliable(other) => {
                trace!(command = other.name(), "unexpected command on data channel");
                return;
            }
        };
        trace!(peer = %peer.id(), channel, bytes = packet.data.len(), "packet received");
        self.events.push_back(Event::Receive {
            peer: peer.id(),
            channel,
            packet,
        });
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Err(e) = self.poll.registry().deregister(&mut self.socket) {
            trace!(error = %e, "deregistering UDP socket failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_clamps_config() {
        let config = HostConfig {
            peer_count: 0,
            channel_limit: 1000,
            mtu: 10,
            ..HostConfig::default()
        };
        let host = Host::bind(loopback(), config).unwrap();
        assert_eq!(host.config().peer_count, 1);
        assert_eq!(host.config().channel_limit, MAX_CHANNELS);
        assert_eq!(host.config().mtu, MIN_MTU);
        assert_ne!(host.local_addr().port(), 0);
    }

    #[test]
    fn test_connect_uses_slots_and_rejects_when_full() {
        let mut host = Host::bind(
            loopback(),
            HostConfig {
                peer_count: 2,
                ..HostConfig::default()
            },
        )
        .unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let a = host.connect(target, 2, 0).unwrap();
        let b = host.connect(target, 0, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(host.peer(a).unwrap().state(), PeerState::Connecting);
        assert_eq!(host.peer(b).unwrap().channel_count(), 1);
        assert!(matches!(
            host.connect(target, 1, 0),
            Err(HostError::NoAvailablePeers)
        ));
    }

    #[test]
    fn test_send_requires_connected_peer() {
        let mut host = Host::bind(loopback(), HostConfig::default()).unwrap();
        let peer = host.connect("127.0.0.1:9".parse().unwrap(), 1, 0).unwrap();
        assert!(matches!(
            host.send(peer, 0, Packet::reliable(vec![1])),
            Err(HostError::NotConnected)
        ));
    }

    #[test]
    fn test_reset_makes_id_stale() {
        let mut host = Host::bind(loopback(), HostConfig::default()).unwrap();
        let peer = host.connect("127.0.0.1:9".parse().unwrap(), 1, 0).unwrap();
        host.reset(peer).unwrap();
        assert!(host.peer(peer).is_none());
        assert!(matches!(host.ping(peer), Err(HostError::InvalidPeer)));
        assert!(host.check_events().is_none());
    }

    #[test]
    fn test_malformed_datagrams_are_counted_and_dropped() {
        let mut host = Host::bind(loopback(), HostConfig::default()).unwrap();
        let sender = std::net::UdpSocket::bind(loopback()).unwrap();
        sender.send_to(&[0xFF, 1, 2, 3], host.local_addr()).unwrap();
        sender.send_to(&[], host.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while host.stats().datagrams_dropped < 2 && Instant::now() < deadline {
            assert!(host.service(Duration::from_millis(20)).unwrap().is_none());
        }
        assert_eq!(host.stats().datagrams_dropped, 2);
    }

    #[test]
    fn test_packet_accessors() {
        let packet = Packet::unreliable(b"abc".to_vec());
        assert!(!packet.is_reliable());
        assert_eq!(packet.data(), b"abc");
        assert_eq!(Packet::reliable("x").into_data(), b"x".to_vec());
    }
}
