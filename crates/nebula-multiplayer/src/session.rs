//! Sessions: one per connected client, whatever transport it came in on.
//!
//! A session pairs an endpoint (a framed stream socket or a reliable-UDP
//! peer) with an inbox the session registry drains on the simulation thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nebula_net::{FrameError, MessageSocket, NetMessage, encode_frame};
use nebula_rudp::{Host, HostError, Packet, PeerId};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Process-unique session identifier. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Monotonic id source, safe to share between threads.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

static SESSION_IDS: IdGenerator = IdGenerator::new(1);

// ---------------------------------------------------------------------------
// Inboxes
// ---------------------------------------------------------------------------

/// Anything a session can pull decoded messages from.
pub trait MessageSource: Send + Sync {
    fn try_pop(&self) -> Option<Box<dyn NetMessage>>;
}

impl MessageSource for MessageSocket {
    fn try_pop(&self) -> Option<Box<dyn NetMessage>> {
        MessageSocket::try_pop(self)
    }
}

/// Inbox filled by the code that owns the transport, used for UDP peers
/// whose packets arrive through [`Host::service`].
#[derive(Default)]
pub struct PeerInbox {
    queue: Mutex<VecDeque<Box<dyn NetMessage>>>,
}

impl PeerInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Box<dyn NetMessage>) {
        self.queue.lock().push_back(message);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl MessageSource for PeerInbox {
    fn try_pop(&self) -> Option<Box<dyn NetMessage>> {
        self.queue.lock().pop_front()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Where a session's outgoing messages go.
#[derive(Clone)]
pub enum SessionEndpoint {
    Stream(MessageSocket),
    Peer(PeerId),
}

impl fmt::Debug for SessionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(socket) => match socket.id() {
                Some(id) => write!(f, "Stream({id:?})"),
                None => f.write_str("Stream(closed)"),
            },
            Self::Peer(peer) => write!(f, "Peer({peer})"),
        }
    }
}

/// Failure to hand a message to a session's transport.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// One connected client.
pub struct Session {
    id: SessionId,
    name: Mutex<String>,
    ready: AtomicBool,
    active: AtomicBool,
    endpoint: SessionEndpoint,
    inbox: Arc<dyn MessageSource>,
}

impl Session {
    /// Session draining an arbitrary source.
    pub fn new(endpoint: SessionEndpoint, inbox: Arc<dyn MessageSource>) -> Self {
        Self {
            id: SESSION_IDS.next_id(),
            name: Mutex::new(String::new()),
            ready: AtomicBool::new(false),
            active: AtomicBool::new(true),
            endpoint,
            inbox,
        }
    }

    /// Session over a framed stream socket; the socket is its own inbox.
    pub fn from_stream(socket: MessageSocket) -> Self {
        let inbox: Arc<dyn MessageSource> = Arc::new(socket.clone());
        Self::new(SessionEndpoint::Stream(socket), inbox)
    }

    /// Session for a UDP peer, fed through `inbox`.
    pub fn from_peer(peer: PeerId, inbox: Arc<PeerInbox>) -> Self {
        Self::new(SessionEndpoint::Peer(peer), inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// False once the session has been deregistered. Never becomes true again.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }

    pub fn try_pop(&self) -> Option<Box<dyn NetMessage>> {
        self.inbox.try_pop()
    }

    /// Queue `message` on the session's transport. Peer sessions go out
    /// reliably on `channel`; stream sessions ignore it.
    pub fn send(
        &self,
        host: &mut Host,
        channel: u8,
        message: Box<dyn NetMessage>,
    ) -> Result<(), SendError> {
        match &self.endpoint {
            SessionEndpoint::Stream(socket) => socket.push(message)?,
            SessionEndpoint::Peer(peer) => {
                let frame = encode_frame(message.as_ref())?;
                host.send(*peer, channel, Packet::reliable(frame))?;
            }
        }
        Ok(())
    }

    /// Close the underlying transport. Stream sockets flush first; peers get
    /// a graceful disconnect.
    pub fn close(&self, host: &mut Host) -> Result<(), SendError> {
        match &self.endpoint {
            SessionEndpoint::Stream(socket) => socket.close()?,
            SessionEndpoint::Peer(peer) => host.disconnect_later(*peer, 0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("ready", &self.is_ready())
            .field("active", &self.is_active())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_net::messages::Chat;
    use nebula_net::{MessageSocketConfig, NoopHandler, SocketEngine, SystemResolver};
    use std::net::TcpListener;

    /// A stream socket dialing a listener that never accepts.
    fn stream_socket() -> (MessageSocket, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let socket = MessageSocket::begin_connect(
            SocketEngine::global(),
            "127.0.0.1",
            port,
            Arc::new(SystemResolver),
            Arc::new(NoopHandler),
            MessageSocketConfig::default(),
        )
        .unwrap();
        (socket, listener)
    }

    fn chat(text: &str) -> Box<dyn NetMessage> {
        Box::new(Chat {
            sender: 1,
            text: text.to_string(),
        })
    }

    struct Fixed(Mutex<Vec<Box<dyn NetMessage>>>);

    impl MessageSource for Fixed {
        fn try_pop(&self) -> Option<Box<dyn NetMessage>> {
            let mut items = self.0.lock();
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        }
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let ids = IdGenerator::new(10);
        assert_eq!(ids.next_id(), SessionId(10));
        assert_eq!(ids.next_id(), SessionId(11));
        assert_eq!(ids.next_id(), SessionId(12));
    }

    #[test]
    fn test_sessions_get_distinct_increasing_ids() {
        let (socket, _listener) = stream_socket();
        let a = Session::from_stream(socket.clone());
        let b = Session::from_stream(socket);
        assert!(b.id() > a.id());
        assert!(matches!(a.endpoint(), SessionEndpoint::Stream(_)));
    }

    #[test]
    fn test_peer_inbox_is_fifo() {
        let inbox = PeerInbox::new();
        assert!(inbox.is_empty());
        inbox.push(chat("one"));
        inbox.push(chat("two"));
        assert_eq!(inbox.len(), 2);

        let first = inbox.try_pop().unwrap();
        assert_eq!(first.downcast_ref::<Chat>().unwrap().text, "one");
        let second = inbox.try_pop().unwrap();
        assert_eq!(second.downcast_ref::<Chat>().unwrap().text, "two");
        assert!(inbox.try_pop().is_none());
    }

    #[test]
    fn test_session_drains_custom_source() {
        let (socket, _listener) = stream_socket();
        let source = Arc::new(Fixed(Mutex::new(vec![chat("hi")])));
        let session = Session::new(SessionEndpoint::Stream(socket), source);
        assert!(session.try_pop().is_some());
        assert!(session.try_pop().is_none());
    }

    #[test]
    fn test_session_flags() {
        let (socket, _listener) = stream_socket();
        let session = Session::from_stream(socket);
        assert!(session.is_active());
        assert!(!session.is_ready());
        assert_eq!(session.name(), "");

        session.set_name("ada");
        session.set_ready(true);
        assert_eq!(session.name(), "ada");
        assert!(session.is_ready());

        assert!(session.deactivate());
        assert!(!session.deactivate());
        assert!(!session.is_active());
    }
}
