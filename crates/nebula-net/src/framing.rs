//! Message framing over a [`StreamSocket`].
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! +-----------+-------------------+------------------+
//! | kind (1)  | length (2)        | body             |
//! | u8        | u16 big-endian    | (length bytes)   |
//! +-----------+-------------------+------------------+
//! ```
//!
//! The length does **not** include the 3 header bytes. A length of 0 is a
//! valid frame for kinds without fields.
//!
//! [`MessageSocket`] runs two independent pipelines on top of the stream:
//! the writer pops one queued message at a time and issues a single write
//! for header and body; the reader keeps exactly one read outstanding,
//! alternating between a header and the body it announces.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::engine::{SocketEngine, SocketId};
use crate::error::{CloseReason, NetError};
use crate::platform::SocketOptions;
use crate::registry::MessageRegistry;
use crate::resolve::Resolver;
use crate::schema::{CodecError, NetMessage, Writer};
use crate::stream::{StreamHandler, StreamSocket};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest accepted body, both directions. Capped at `u16::MAX`.
    pub max_payload_size: u16,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: u16::MAX,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// The 3-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub length: u16,
}

impl FrameHeader {
    /// Header size on the wire.
    pub const LEN: usize = 3;

    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes {
            [kind, hi, lo, ..] => Ok(Self {
                kind: *kind,
                length: u16::from_be_bytes([*hi, *lo]),
            }),
            _ => Err(CodecError::Truncated {
                needed: Self::LEN,
                remaining: bytes.len(),
            }),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [hi, lo] = self.length.to_be_bytes();
        [self.kind, hi, lo]
    }
}

fn check_size(size: usize, config: &FrameConfig) -> Result<u16, FrameError> {
    let max = usize::from(config.max_payload_size);
    if size > max {
        return Err(FrameError::PayloadTooLarge { size, max });
    }
    // `max` never exceeds u16::MAX, so this cannot truncate.
    Ok(size as u16)
}

/// Encode `message` as one frame at the start of `buf`, growing it to the
/// next power of two when too small. Returns the frame length.
pub fn encode_frame_into(
    message: &dyn NetMessage,
    buf: &mut Vec<u8>,
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    let body_len = message.encoded_len();
    let length = check_size(body_len, config)?;
    let total = FrameHeader::LEN + body_len;
    if buf.len() < total {
        buf.resize(total.next_power_of_two(), 0);
    }
    let header = FrameHeader {
        kind: message.kind(),
        length,
    };
    buf[..FrameHeader::LEN].copy_from_slice(&header.to_bytes());
    let written = message.serialize(&mut Writer::new(&mut buf[FrameHeader::LEN..total]))?;
    if written != body_len {
        return Err(CodecError::Truncated {
            needed: body_len,
            remaining: written,
        }
        .into());
    }
    Ok(total)
}

/// Encode `message` as one standalone frame.
pub fn encode_frame(message: &dyn NetMessage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    let len = encode_frame_into(message, &mut buf, &FrameConfig::default())?;
    buf.truncate(len);
    Ok(buf)
}

/// Incremental decoder for a byte stream of frames.
///
/// Bytes may arrive in any split; a frame is only produced once its header
/// and all announced body bytes are present.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame as header plus body, if one is buffered.
    pub fn next_frame(&mut self) -> Option<(FrameHeader, Vec<u8>)> {
        let header = FrameHeader::parse(&self.buf).ok()?;
        let end = FrameHeader::LEN + usize::from(header.length);
        if self.buf.len() < end {
            return None;
        }
        let body = self.buf[FrameHeader::LEN..end].to_vec();
        self.buf.drain(..end);
        Some((header, body))
    }

    /// Next complete frame decoded through `registry`. A frame that fails to
    /// decode is consumed and reported as an error.
    pub fn next_message(
        &mut self,
        registry: &MessageRegistry,
    ) -> Option<Result<Box<dyn NetMessage>, CodecError>> {
        let (header, body) = self.next_frame()?;
        Some(registry.decode(header.kind, &body))
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Message socket
// ---------------------------------------------------------------------------

/// Notifications from a [`MessageSocket`].
pub trait MessageSocketHandler: Send + Sync {
    fn on_connect_complete(&self, _result: Result<(), NetError>) {}

    /// A message was queued; fetch it with [`MessageSocket::try_pop`].
    /// Runs on the engine thread, so it should only wake the consumer.
    fn on_message(&self) {}

    /// The connection ended because of the peer or an error.
    fn on_close(&self, _reason: CloseReason) {}
}

/// Handler that ignores every notification.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl MessageSocketHandler for NoopHandler {}

/// Everything a [`MessageSocket`] needs besides its transport.
#[derive(Debug, Clone)]
pub struct MessageSocketConfig {
    pub registry: Arc<MessageRegistry>,
    pub frame: FrameConfig,
    pub socket: SocketOptions,
}

impl Default for MessageSocketConfig {
    fn default() -> Self {
        Self {
            registry: MessageRegistry::shared(),
            frame: FrameConfig::default(),
            socket: SocketOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadPhase {
    Header,
    Body(FrameHeader),
    /// Draining the body of an oversized frame.
    Skip(FrameHeader),
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Box<dyn NetMessage>>,
    writing: bool,
    spare: Vec<u8>,
}

struct Inner {
    stream: OnceLock<StreamSocket>,
    registry: Arc<MessageRegistry>,
    frame: FrameConfig,
    handler: Arc<dyn MessageSocketHandler>,
    outbound: Mutex<Outbound>,
    inbound: Mutex<VecDeque<Box<dyn NetMessage>>>,
    phase: Mutex<ReadPhase>,
    closed: AtomicBool,
}

/// Routes stream completions to the socket without keeping it alive.
struct Adapter(Weak<Inner>);

impl StreamHandler for Adapter {
    fn on_connect_complete(&self, result: Result<(), NetError>) {
        if let Some(inner) = self.0.upgrade() {
            if result.is_err() {
                inner.closed.store(true, Ordering::Release);
            }
            inner.handler.on_connect_complete(result);
        }
    }

    fn on_read_complete(&self, buf: Vec<u8>) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_read(buf);
        }
    }

    fn on_write_complete(&self, buf: Vec<u8>) {
        if let Some(inner) = self.0.upgrade() {
            inner.outbound.lock().spare = buf;
            inner.pump();
        }
    }

    fn on_close(&self, reason: CloseReason) {
        if let Some(inner) = self.0.upgrade() {
            inner.closed.store(true, Ordering::Release);
            let dropped = {
                let mut out = inner.outbound.lock();
                out.writing = false;
                std::mem::take(&mut out.queue).len()
            };
            debug!(%reason, dropped, "message socket closed");
            inner.handler.on_close(reason);
        }
    }
}

impl Inner {
    fn stream(&self) -> Option<&StreamSocket> {
        self.stream.get()
    }

    fn read_header(&self, buf: Vec<u8>) {
        *self.phase.lock() = ReadPhase::Header;
        if let Some(stream) = self.stream()
            && let Err(e) = stream.read(buf, FrameHeader::LEN)
        {
            debug!(error = %e, "could not arm header read");
        }
    }

    fn handle_read(&self, buf: Vec<u8>) {
        let phase = *self.phase.lock();
        match phase {
            ReadPhase::Header => {
                let header = match FrameHeader::parse(&buf) {
                    Ok(header) => header,
                    Err(e) => {
                        warn!(error = %e, "short frame header");
                        return self.read_header(buf);
                    }
                };
                trace!(kind = header.kind, length = header.length, "frame header");
                if header.length == 0 {
                    self.deliver(header, &[]);
                    return self.read_header(buf);
                }
                *self.phase.lock() = if header.length > self.frame.max_payload_size {
                    ReadPhase::Skip(header)
                } else {
                    ReadPhase::Body(header)
                };
                if let Some(stream) = self.stream()
                    && let Err(e) = stream.read(buf, usize::from(header.length))
                {
                    debug!(error = %e, "could not arm body read");
                }
            }
            ReadPhase::Body(header) => {
                self.deliver(header, &buf);
                self.read_header(buf);
            }
            ReadPhase::Skip(header) => {
                warn!(
                    kind = header.kind,
                    length = header.length,
                    max = self.frame.max_payload_size,
                    "dropping oversized inbound frame"
                );
                self.read_header(buf);
            }
        }
    }

    fn deliver(&self, header: FrameHeader, body: &[u8]) {
        match self.registry.decode(header.kind, body) {
            Ok(message) => {
                trace!(message = %message.to_display_string(), "received");
                self.inbound.lock().push_back(message);
                self.handler.on_message();
            }
            Err(e) => warn!(
                kind = header.kind,
                error = %e,
                body = %hex(body),
                "dropping undecodable message"
            ),
        }
    }

    /// Write queued messages one at a time. Only one caller runs the pump;
    /// the `writing` flag hands it over between `push` and write completions.
    fn pump(&self) {
        loop {
            let (message, mut buf) = {
                let mut out = self.outbound.lock();
                match out.queue.pop_front() {
                    Some(message) => (message, std::mem::take(&mut out.spare)),
                    None => {
                        out.writing = false;
                        return;
                    }
                }
            };

            if message.is_control() {
                debug!("close requested, shutting down after queued writes");
                self.shutdown();
                let mut out = self.outbound.lock();
                out.queue.clear();
                out.writing = false;
                return;
            }

            let len = match encode_frame_into(message.as_ref(), &mut buf, &self.frame) {
                Ok(len) => len,
                Err(e) => {
                    warn!(kind = message.kind(), error = %e, "dropping unencodable message");
                    self.outbound.lock().spare = buf;
                    continue;
                }
            };
            trace!(message = %message.to_display_string(), bytes = len, "sending");

            let Some(stream) = self.stream() else {
                self.outbound.lock().writing = false;
                return;
            };
            match stream.write(buf, len) {
                Ok(()) => return,
                Err(e) => {
                    debug!(error = %e, "write failed, dropping outbound queue");
                    let mut out = self.outbound.lock();
                    out.queue.clear();
                    out.writing = false;
                    return;
                }
            }
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(stream) = self.stream()
            && let Err(e) = stream.close()
        {
            debug!(error = %e, "close failed");
        }
    }
}

/// Framed message connection. Cloning yields another handle to the same
/// connection; the socket closes when the last handle is dropped.
#[derive(Clone)]
pub struct MessageSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSocket")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("inbound", &self.inbound_len())
            .field("outbound", &self.outbound_len())
            .finish()
    }
}

impl MessageSocket {
    fn build(
        handler: Arc<dyn MessageSocketHandler>,
        config: MessageSocketConfig,
        open: impl FnOnce(Arc<dyn StreamHandler>) -> Result<StreamSocket, NetError>,
    ) -> Result<Self, NetError> {
        let inner = Arc::new(Inner {
            stream: OnceLock::new(),
            registry: config.registry,
            frame: config.frame,
            handler,
            outbound: Mutex::new(Outbound::default()),
            inbound: Mutex::new(VecDeque::new()),
            phase: Mutex::new(ReadPhase::Header),
            closed: AtomicBool::new(false),
        });
        let adapter: Arc<dyn StreamHandler> = Arc::new(Adapter(Arc::downgrade(&inner)));
        let stream = open(adapter)?;
        let _ = inner.stream.set(stream);
        inner.read_header(vec![0; FrameHeader::LEN]);
        Ok(Self { inner })
    }

    /// Resolve and connect in the background; see
    /// [`StreamSocket::begin_connect`].
    pub fn begin_connect(
        engine: &SocketEngine,
        host: &str,
        port: u16,
        resolver: Arc<dyn Resolver>,
        handler: Arc<dyn MessageSocketHandler>,
        config: MessageSocketConfig,
    ) -> Result<Self, NetError> {
        Self::build(handler, config, |adapter| {
            StreamSocket::begin_connect(engine, host, port, adapter, resolver)
        })
    }

    /// Wrap an accepted connection.
    pub fn from_accepted(
        engine: &SocketEngine,
        id: SocketId,
        handler: Arc<dyn MessageSocketHandler>,
        config: MessageSocketConfig,
    ) -> Result<Self, NetError> {
        let options = config.socket.clone();
        Self::build(handler, config, |adapter| {
            StreamSocket::from_accepted(engine, id, adapter, &options)
        })
    }

    /// Queue `message` for sending. The [`Close`](crate::messages::Close)
    /// control message closes the socket once everything queued before it
    /// has been written.
    pub fn push(&self, message: Box<dyn NetMessage>) -> Result<(), FrameError> {
        if !message.is_control() {
            check_size(message.encoded_len(), &self.inner.frame)?;
        }
        if self.is_closed() {
            return Err(NetError::ConnectionBroken.into());
        }
        let start = {
            let mut out = self.inner.outbound.lock();
            out.queue.push_back(message);
            !std::mem::replace(&mut out.writing, true)
        };
        if start {
            self.inner.pump();
        }
        Ok(())
    }

    /// Next received message, if any.
    pub fn try_pop(&self) -> Option<Box<dyn NetMessage>> {
        self.inner.inbound.lock().pop_front()
    }

    pub fn inbound_len(&self) -> usize {
        self.inner.inbound.lock().len()
    }

    /// Messages queued but not yet handed to the stream.
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.lock().queue.len()
    }

    /// Close after the queued messages have been written.
    pub fn close(&self) -> Result<(), FrameError> {
        self.push(Box::new(crate::messages::Close))
    }

    /// Close immediately, dropping anything still queued.
    pub fn close_now(&self) {
        self.inner.outbound.lock().queue.clear();
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner
            .stream()
            .ok_or(NetError::NotConnected)?
            .peer_addr()
    }

    pub fn id(&self) -> Option<SocketId> {
        self.inner.stream().and_then(StreamSocket::id)
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.inner.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Chat, Ping};

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FrameHeader {
            kind: 0x10,
            length: 0x0102,
        };
        assert_eq!(header.to_bytes(), [0x10, 0x01, 0x02]);
        assert_eq!(FrameHeader::parse(&[0x10, 0x01, 0x02, 0xFF]).unwrap(), header);
        assert!(FrameHeader::parse(&[0x10, 0x01]).is_err());
    }

    #[test]
    fn test_chat_frame_bytes() {
        let frame = encode_frame(&Chat {
            sender: 7,
            text: "hi".into(),
        })
        .unwrap();
        assert_eq!(&frame[..3], &[0x10, 0x00, 0x08]);
        assert_eq!(frame.len(), 3 + 8);
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let config = FrameConfig {
            max_payload_size: 4,
        };
        let chat = Chat {
            sender: 1,
            text: "too long".into(),
        };
        let result = encode_frame_into(&chat, &mut Vec::new(), &config);
        assert!(
            matches!(result, Err(FrameError::PayloadTooLarge { size: 14, max: 4 })),
            "got {result:?}"
        );
    }

    #[test]
    fn test_buffer_grows_to_power_of_two_and_never_shrinks() {
        let config = FrameConfig::default();
        let mut buf = Vec::new();
        let len = encode_frame_into(
            &Chat {
                sender: 1,
                text: "x".repeat(40),
            },
            &mut buf,
            &config,
        )
        .unwrap();
        assert_eq!(len, 3 + 4 + 2 + 40);
        assert_eq!(buf.len(), 64);

        let len = encode_frame_into(&Ping { nonce: 9 }, &mut buf, &config).unwrap();
        assert_eq!(len, 7);
        assert_eq!(buf.len(), 64, "reusable buffer must not shrink");
    }

    #[test]
    fn test_decoder_reassembles_arbitrary_splits() {
        let registry = MessageRegistry::with_builtin();
        let mut stream = Vec::new();
        for i in 0..5u32 {
            stream.extend(
                encode_frame(&Chat {
                    sender: i,
                    text: format!("msg {i}"),
                })
                .unwrap(),
            );
        }
        stream.extend(encode_frame(&Ping { nonce: 77 }).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.extend(chunk);
            while let Some(message) = decoder.next_message(&registry) {
                decoded.push(message.unwrap());
            }
        }
        assert_eq!(decoded.len(), 6);
        for (i, message) in decoded[..5].iter().enumerate() {
            let chat = message.downcast_ref::<Chat>().unwrap();
            assert_eq!(chat.sender, i as u32);
            assert_eq!(chat.text, format!("msg {i}"));
        }
        assert_eq!(decoded[5].downcast_ref::<Ping>().unwrap().nonce, 77);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_truncated_frame_waits_for_rest() {
        let registry = MessageRegistry::with_builtin();
        let frame = encode_frame(&Chat {
            sender: 3,
            text: "partial".into(),
        })
        .unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..FrameHeader::LEN + 2]);
        assert!(decoder.next_message(&registry).is_none());
        assert_eq!(decoder.buffered(), FrameHeader::LEN + 2);

        decoder.extend(&frame[FrameHeader::LEN + 2..]);
        let message = decoder.next_message(&registry).unwrap().unwrap();
        assert_eq!(message.downcast_ref::<Chat>().unwrap().text, "partial");
    }

    #[test]
    fn test_undecodable_frame_is_consumed() {
        let registry = MessageRegistry::with_builtin();
        let mut decoder = FrameDecoder::new();
        // Ping claims one body byte but needs four.
        decoder.extend(&[Ping::KIND, 0x00, 0x01, 0xAA]);
        decoder.extend(&encode_frame(&Ping { nonce: 5 }).unwrap());
        assert!(decoder.next_message(&registry).unwrap().is_err());
        let next = decoder.next_message(&registry).unwrap().unwrap();
        assert_eq!(next.downcast_ref::<Ping>().unwrap().nonce, 5);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex(&[0x00, 0xAB, 0x10]), "00ab10");
    }
}
