//! Readiness sources for the socket engine.
//!
//! The engine talks to the OS multiplexer only through [`EventSource`] (owned
//! by the dispatch thread) and [`EventRegistrar`] (shared with every thread
//! that registers sockets or needs to wake the loop). The backend is picked at
//! build time through the [`Backend`] alias.

use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Token reserved for the loop's wake-up channel.
pub(crate) const WAKE_TOKEN: usize = usize::MAX;

/// The OS object held by an engine slot.
pub(crate) enum SocketIo {
    /// Allocated by `initialize`, not yet connected or bound.
    Fresh(socket2::Socket),
    /// Connected (or connecting) stream.
    Stream(mio::net::TcpStream),
    /// Listening socket.
    Listener(mio::net::TcpListener),
    /// Temporarily or permanently without a descriptor.
    Detached,
}

/// Readiness reported for one token in one wait.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

/// Loop-owned half of a multiplexer backend.
pub(crate) trait EventSource: Send + Sized + 'static {
    /// Shared half handed to registering threads.
    type Registrar: EventRegistrar;

    /// Create a new multiplexer instance and its wake-up channel.
    fn open() -> io::Result<(Self, Self::Registrar)>;

    /// Block until at least one socket is ready, the loop is notified, or
    /// `timeout` elapses. Appends readiness to `out`.
    fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// Thread-safe half of a multiplexer backend.
pub(crate) trait EventRegistrar: Send + Sync + 'static {
    /// Start reporting read and write readiness for `io` under `token`.
    fn register(&self, io: &mut SocketIo, token: usize) -> io::Result<()>;

    /// Stop reporting readiness for `io`. Must happen before the descriptor closes.
    fn deregister(&self, io: &mut SocketIo) -> io::Result<()>;

    /// Wake the dispatch loop from any thread.
    fn notify(&self) -> io::Result<()>;
}

/// Backend used on this build: epoll/kqueue on POSIX, the IOCP poller on
/// Windows, both with a dedicated waker as control channel.
pub(crate) type Backend = MioSource;

/// `mio` poller owned by the dispatch thread.
pub(crate) struct MioSource {
    poll: Poll,
    events: Events,
}

/// Registry plus waker shared with the rest of the engine.
pub(crate) struct MioRegistrar {
    registry: Registry,
    waker: Waker,
}

impl EventSource for MioSource {
    type Registrar = MioRegistrar;

    fn open() -> io::Result<(Self, Self::Registrar)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), Token(WAKE_TOKEN))?;
        Ok((
            Self {
                poll,
                events: Events::with_capacity(256),
            },
            MioRegistrar { registry, waker },
        ))
    }

    fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            out.push(Readiness {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_closed: event.is_read_closed(),
                write_closed: event.is_write_closed(),
                error: event.is_error(),
            });
        }
        Ok(())
    }
}

impl EventRegistrar for MioRegistrar {
    fn register(&self, io: &mut SocketIo, token: usize) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match io {
            SocketIo::Stream(stream) => self.registry.register(stream, Token(token), interest),
            SocketIo::Listener(listener) => {
                self.registry
                    .register(listener, Token(token), Interest::READABLE)
            }
            SocketIo::Fresh(_) | SocketIo::Detached => Ok(()),
        }
    }

    fn deregister(&self, io: &mut SocketIo) -> io::Result<()> {
        match io {
            SocketIo::Stream(stream) => self.registry.deregister(stream),
            SocketIo::Listener(listener) => self.registry.deregister(listener),
            SocketIo::Fresh(_) | SocketIo::Detached => Ok(()),
        }
    }

    fn notify(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
