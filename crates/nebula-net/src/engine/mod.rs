//! Socket event engine.
//!
//! One background thread (`nebula-net-io`) waits for readiness on every
//! registered socket and invokes the owning [`SocketHandler`]. The thread is
//! started when the first socket is created and stopped when the last one is
//! destroyed.
//!
//! The OS multiplexer is edge-triggered, so each slot keeps a readiness cache.
//! A socket whose cached readiness intersects its [`OpMask`] is dispatched on
//! every pass until a read or write reports would-block, which makes the
//! callbacks behave level-triggered.
//!
//! Non-blocking I/O calls are issued under the arena lock. Callbacks are
//! collected under the lock and invoked after it is released, so handlers are
//! free to call back into the engine.

mod source;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, SockRef};
use tracing::{debug, error, trace, warn};

use crate::error::{CloseReason, NetError};
use crate::platform::{self, SocketOptions};
use source::{Backend, EventRegistrar, EventSource, Readiness, SocketIo, WAKE_TOKEN};

type Registrar = <Backend as EventSource>::Registrar;

/// Handle to a socket owned by a [`SocketEngine`].
///
/// Handles are generational: once a socket is destroyed its handle stays
/// invalid even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    index: u32,
    generation: u32,
}

impl SocketId {
    fn token(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Transport protocol requested from [`SocketEngine::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP over IPv4.
    Tcp,
    /// TCP over IPv6.
    Tcp6,
    /// Datagram sockets are driven by the reliable-UDP host, not the engine.
    Udp,
}

/// Connection state of an engine socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    ConnectStarted,
    Connected,
    ClosedLocally,
}

/// Which readiness callbacks a socket currently wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpMask {
    pub read: bool,
    pub write: bool,
}

impl OpMask {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    pub const BOTH: Self = Self {
        read: true,
        write: true,
    };
}

/// Callback target for one socket. All methods run on the dispatch thread
/// with no engine lock held.
pub trait SocketHandler: Send + Sync {
    /// The socket is readable (or, for a listener, has a pending connection).
    fn on_readable(&self, _engine: &SocketEngine, _id: SocketId) {}

    /// The socket is writable.
    fn on_writable(&self, _engine: &SocketEngine, _id: SocketId) {}

    /// The socket was closed. Delivered at most once per socket.
    fn on_closed(&self, _engine: &SocketEngine, _id: SocketId, _reason: CloseReason) {}
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct Slot {
    generation: u32,
    io: SocketIo,
    state: ConnState,
    last_error: Option<io::ErrorKind>,
    mask: OpMask,
    readable: bool,
    writable: bool,
    errored: bool,
    handler: Option<Weak<dyn SocketHandler>>,
    pending_close: Option<CloseReason>,
    close_queued: bool,
}

impl Slot {
    fn new(generation: u32, io: SocketIo, state: ConnState) -> Self {
        Self {
            generation,
            io,
            state,
            last_error: None,
            mask: OpMask::NONE,
            readable: false,
            writable: false,
            errored: false,
            handler: None,
            pending_close: None,
            close_queued: false,
        }
    }

    /// Queue the one and only close notification for this socket.
    fn fail(&mut self, reason: CloseReason) {
        if self.close_queued {
            return;
        }
        self.close_queued = true;
        if self.state != ConnState::ClosedLocally {
            self.state = ConnState::Unconnected;
        }
        self.pending_close = Some(reason);
    }

    fn take_fresh(&mut self) -> Result<socket2::Socket, NetError> {
        match std::mem::replace(&mut self.io, SocketIo::Detached) {
            SocketIo::Fresh(socket) => Ok(socket),
            other => {
                self.io = other;
                Err(NetError::AlreadyConnected)
            }
        }
    }

    /// Resolve a pending non-blocking connect after the first writable or
    /// error event.
    fn finish_connect(&mut self, id: SocketId) {
        let SocketIo::Stream(stream) = &self.io else {
            return;
        };
        let outcome = match stream.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(err) => Err(err),
            },
        };
        match outcome {
            Ok(true) => {
                self.state = ConnState::Connected;
                debug!(socket = %id, "connect completed");
            }
            Ok(false) => self.writable = false,
            Err(err) => {
                debug!(socket = %id, error = %err, "connect failed");
                self.last_error = Some(err.kind());
                self.fail(CloseReason::ConnectFailed(err.to_string()));
            }
        }
    }
}

struct Driver {
    registrar: Registrar,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Driver {
    /// Ask the loop to exit and join it unless we are the loop.
    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.registrar.notify() {
            warn!(error = %e, "failed to wake dispatch loop for shutdown");
        }
        if let Some(handle) = self.thread.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            error!("dispatch loop panicked");
        }
    }
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    live: usize,
    driver: Option<Driver>,
}

impl Arena {
    fn insert(&mut self, io: SocketIo, state: ConnState) -> SocketId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.generations[index as usize];
        self.slots[index as usize] = Some(Slot::new(generation, io, state));
        self.live += 1;
        SocketId { index, generation }
    }

    fn remove(&mut self, id: SocketId) -> Option<Slot> {
        let entry = self.slots.get_mut(id.index as usize)?;
        if entry.as_ref()?.generation != id.generation {
            return None;
        }
        let slot = entry.take();
        let generation = &mut self.generations[id.index as usize];
        *generation = generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        slot
    }

    fn slot(&self, id: SocketId) -> Result<&Slot, NetError> {
        self.slots
            .get(id.index as usize)
            .and_then(Option::as_ref)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(NetError::UnknownSocket)
    }

    fn slot_mut(&mut self, id: SocketId) -> Result<&mut Slot, NetError> {
        self.slots
            .get_mut(id.index as usize)
            .and_then(Option::as_mut)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(NetError::UnknownSocket)
    }

    fn slot_and_registrar(&mut self, id: SocketId) -> Result<(&mut Slot, &Registrar), NetError> {
        let registrar = self
            .driver
            .as_ref()
            .map(|driver| &driver.registrar)
            .ok_or(NetError::UnknownSocket)?;
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .and_then(Option::as_mut)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(NetError::UnknownSocket)?;
        Ok((slot, registrar))
    }

    fn notify(&self) {
        if let Some(driver) = &self.driver
            && let Err(e) = driver.registrar.notify()
        {
            warn!(error = %e, "failed to wake dispatch loop");
        }
    }
}

enum Job {
    Readable(SocketId, Arc<dyn SocketHandler>),
    Writable(SocketId, Arc<dyn SocketHandler>),
    Closed(SocketId, Arc<dyn SocketHandler>, CloseReason),
}

impl Job {
    fn dispatch(self, engine: &SocketEngine) {
        match self {
            Job::Readable(id, handler) => handler.on_readable(engine, id),
            Job::Writable(id, handler) => handler.on_writable(engine, id),
            Job::Closed(id, handler, reason) => {
                trace!(socket = %id, %reason, "delivering close");
                handler.on_closed(engine, id, reason);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Readiness-driven socket engine. Cloning yields another handle to the same
/// engine.
#[derive(Clone, Default)]
pub struct SocketEngine {
    arena: Arc<Mutex<Arena>>,
}

impl fmt::Debug for SocketEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("SocketEngine")
            .field("sockets", &arena.live)
            .field("running", &arena.driver.is_some())
            .finish()
    }
}

impl SocketEngine {
    /// Create an independent engine with no sockets and no thread.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide engine.
    pub fn global() -> &'static SocketEngine {
        static GLOBAL: OnceLock<SocketEngine> = OnceLock::new();
        GLOBAL.get_or_init(SocketEngine::new)
    }

    /// Allocate a non-blocking stream socket.
    pub fn initialize(&self, protocol: Protocol) -> Result<SocketId, NetError> {
        let domain = match protocol {
            Protocol::Tcp => Domain::IPV4,
            Protocol::Tcp6 => Domain::IPV6,
            Protocol::Udp => return Err(NetError::InvalidProtocol),
        };
        let socket = platform::new_stream_socket(domain)?;
        let mut arena = self.arena.lock();
        let id = self.insert_running(&mut arena, SocketIo::Fresh(socket), ConnState::Unconnected)?;
        trace!(socket = %id, ?protocol, "socket initialized");
        Ok(id)
    }

    /// Start a non-blocking connect. Returns `ConnectStarted`, or `Connected`
    /// when the OS finished synchronously.
    pub fn connect(&self, id: SocketId, addr: SocketAddr) -> Result<ConnState, NetError> {
        let mut arena = self.arena.lock();
        let (slot, registrar) = arena.slot_and_registrar(id)?;
        let socket = slot.take_fresh()?;
        let state = match socket.connect(&addr.into()) {
            Ok(()) => ConnState::Connected,
            Err(e) if platform::is_connect_in_progress(&e) => ConnState::ConnectStarted,
            Err(e) => {
                slot.last_error = Some(e.kind());
                slot.io = SocketIo::Fresh(socket);
                return Err(e.into());
            }
        };
        slot.io = SocketIo::Stream(mio::net::TcpStream::from_std(socket.into()));
        if let Err(e) = registrar.register(&mut slot.io, id.token()) {
            slot.last_error = Some(e.kind());
            return Err(e.into());
        }
        slot.state = state;
        debug!(socket = %id, %addr, ?state, "connect issued");
        Ok(state)
    }

    /// Bind and listen with default [`SocketOptions`].
    pub fn bind(&self, id: SocketId, addr: SocketAddr) -> Result<(), NetError> {
        self.bind_with(id, addr, &SocketOptions::default())
    }

    /// Bind and listen. The listener is reported readable when a connection
    /// is pending.
    pub fn bind_with(
        &self,
        id: SocketId,
        addr: SocketAddr,
        options: &SocketOptions,
    ) -> Result<(), NetError> {
        let mut arena = self.arena.lock();
        let (slot, registrar) = arena.slot_and_registrar(id)?;
        let socket = slot.take_fresh()?;
        if let Err(e) = platform::listen_on(&socket, addr, options) {
            if let NetError::Io(io) = &e {
                slot.last_error = Some(io.kind());
            }
            slot.io = SocketIo::Fresh(socket);
            return Err(e);
        }
        slot.io = SocketIo::Listener(mio::net::TcpListener::from_std(socket.into()));
        registrar.register(&mut slot.io, id.token())?;
        slot.state = ConnState::Connected;
        debug!(socket = %id, %addr, "listening");
        Ok(())
    }

    /// Accept the next pending connection, or `None` if none is pending.
    pub fn accept(&self, id: SocketId) -> Result<Option<(SocketId, SocketAddr)>, NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        let SocketIo::Listener(listener) = &slot.io else {
            return Err(NetError::NotConnected);
        };
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                slot.readable = false;
                return Ok(None);
            }
            Err(e) => {
                slot.last_error = Some(e.kind());
                return Err(e.into());
            }
        };
        let new_id = arena.insert(SocketIo::Stream(stream), ConnState::Connected);
        let (slot, registrar) = arena.slot_and_registrar(new_id)?;
        if let Err(e) = registrar.register(&mut slot.io, new_id.token()) {
            arena.remove(new_id);
            return Err(e.into());
        }
        debug!(listener = %id, socket = %new_id, %peer, "accepted connection");
        Ok(Some((new_id, peer)))
    }

    /// Take ownership of an already connected std stream.
    pub fn adopt(&self, stream: std::net::TcpStream) -> Result<SocketId, NetError> {
        stream.set_nonblocking(true)?;
        let mut arena = self.arena.lock();
        let io = SocketIo::Stream(mio::net::TcpStream::from_std(stream));
        let id = self.insert_running(&mut arena, io, ConnState::Connected)?;
        let (slot, registrar) = arena.slot_and_registrar(id)?;
        if let Err(e) = registrar.register(&mut slot.io, id.token()) {
            arena.remove(id);
            return Err(e.into());
        }
        trace!(socket = %id, "adopted connected stream");
        Ok(id)
    }

    /// Attach the callback target. A dropped handler silences callbacks.
    pub fn set_handler(&self, id: SocketId, handler: Weak<dyn SocketHandler>) -> Result<(), NetError> {
        let mut arena = self.arena.lock();
        arena.slot_mut(id)?.handler = Some(handler);
        arena.notify();
        Ok(())
    }

    /// Declare which callbacks should fire. Wakes the loop when the mask changes.
    pub fn set_op_mask(&self, id: SocketId, mask: OpMask) -> Result<(), NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        if slot.mask != mask {
            slot.mask = mask;
            arena.notify();
        }
        Ok(())
    }

    /// Atomically edit the op mask. Wakes the loop when it changes.
    pub fn update_op_mask(
        &self,
        id: SocketId,
        edit: impl FnOnce(&mut OpMask),
    ) -> Result<OpMask, NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        let before = slot.mask;
        edit(&mut slot.mask);
        let after = slot.mask;
        if before != after {
            arena.notify();
        }
        Ok(after)
    }

    /// Current op mask.
    pub fn op_mask(&self, id: SocketId) -> Result<OpMask, NetError> {
        Ok(self.arena.lock().slot(id)?.mask)
    }

    /// Apply stream options to a connected socket.
    pub fn configure(&self, id: SocketId, options: &SocketOptions) -> Result<(), NetError> {
        let arena = self.arena.lock();
        match &arena.slot(id)?.io {
            SocketIo::Stream(stream) => Ok(options.apply(SockRef::from(stream))?),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Non-blocking read. `Ok(0)` means nothing is available yet.
    pub fn read(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        if slot.close_queued {
            return Err(NetError::ConnectionBroken);
        }
        match slot.state {
            ConnState::Connected => {}
            ConnState::ConnectStarted => return Ok(0),
            ConnState::Unconnected | ConnState::ClosedLocally => return Err(NetError::NotConnected),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let SocketIo::Stream(stream) = &mut slot.io else {
            return Err(NetError::NotConnected);
        };
        match stream.read(buf) {
            Ok(0) => {
                trace!(socket = %id, "peer closed");
                slot.fail(CloseReason::PeerClosed);
                arena.notify();
                Err(NetError::ConnectionBroken)
            }
            Ok(n) => {
                trace!(socket = %id, bytes = n, "read");
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                slot.readable = false;
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                debug!(socket = %id, error = %e, "read failed");
                slot.last_error = Some(e.kind());
                slot.fail(CloseReason::from_io(&e));
                arena.notify();
                Err(NetError::ConnectionBroken)
            }
        }
    }

    /// Non-blocking write. `Ok(0)` means the send buffer is full.
    pub fn write(&self, id: SocketId, buf: &[u8]) -> Result<usize, NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        if slot.close_queued {
            return Err(NetError::ConnectionBroken);
        }
        match slot.state {
            ConnState::Connected => {}
            ConnState::ConnectStarted => return Ok(0),
            ConnState::Unconnected | ConnState::ClosedLocally => return Err(NetError::NotConnected),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let SocketIo::Stream(stream) = &mut slot.io else {
            return Err(NetError::NotConnected);
        };
        let result = match stream.write(buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            other => other,
        };
        match result {
            Ok(n) => {
                trace!(socket = %id, bytes = n, "wrote");
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                slot.writable = false;
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                debug!(socket = %id, error = %e, "write failed");
                slot.last_error = Some(e.kind());
                slot.fail(CloseReason::from_io(&e));
                arena.notify();
                Err(NetError::ConnectionBroken)
            }
        }
    }

    /// Close locally. `on_closed(Local)` is delivered once unless a close
    /// was already queued.
    pub fn shutdown(&self, id: SocketId) -> Result<(), NetError> {
        let mut arena = self.arena.lock();
        let slot = arena.slot_mut(id)?;
        if let SocketIo::Stream(stream) = &slot.io {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        slot.state = ConnState::ClosedLocally;
        slot.fail(CloseReason::Local);
        arena.notify();
        debug!(socket = %id, "shut down locally");
        Ok(())
    }

    /// Deregister and free the socket. Stops the dispatch loop once no socket
    /// is left.
    pub fn destroy(&self, id: SocketId) {
        let driver = {
            let mut arena = self.arena.lock();
            let Some(mut slot) = arena.remove(id) else {
                return;
            };
            if let Some(driver) = &arena.driver
                && let Err(e) = driver.registrar.deregister(&mut slot.io)
            {
                debug!(socket = %id, error = %e, "deregister failed");
            }
            drop(slot);
            trace!(socket = %id, "socket destroyed");
            if arena.live == 0 {
                arena.driver.take()
            } else {
                None
            }
        };
        if let Some(driver) = driver {
            debug!("last socket destroyed, stopping dispatch loop");
            driver.stop();
        }
    }

    /// Connection state.
    pub fn state(&self, id: SocketId) -> Result<ConnState, NetError> {
        Ok(self.arena.lock().slot(id)?.state)
    }

    /// Kind of the last OS error seen on this socket.
    pub fn last_error(&self, id: SocketId) -> Result<Option<io::ErrorKind>, NetError> {
        Ok(self.arena.lock().slot(id)?.last_error)
    }

    /// Local address.
    pub fn local_addr(&self, id: SocketId) -> Result<SocketAddr, NetError> {
        let arena = self.arena.lock();
        match &arena.slot(id)?.io {
            SocketIo::Fresh(socket) => socket
                .local_addr()?
                .as_socket()
                .ok_or(NetError::NotConnected),
            SocketIo::Stream(stream) => Ok(stream.local_addr()?),
            SocketIo::Listener(listener) => Ok(listener.local_addr()?),
            SocketIo::Detached => Err(NetError::NotConnected),
        }
    }

    /// Remote address of a connected stream.
    pub fn peer_addr(&self, id: SocketId) -> Result<SocketAddr, NetError> {
        let arena = self.arena.lock();
        match &arena.slot(id)?.io {
            SocketIo::Stream(stream) => Ok(stream.peer_addr()?),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Number of live sockets.
    pub fn socket_count(&self) -> usize {
        self.arena.lock().live
    }

    /// Whether the dispatch thread is running.
    pub fn is_running(&self) -> bool {
        self.arena.lock().driver.is_some()
    }

    fn insert_running(
        &self,
        arena: &mut Arena,
        io: SocketIo,
        state: ConnState,
    ) -> Result<SocketId, NetError> {
        let id = arena.insert(io, state);
        if arena.driver.is_none() {
            match self.spawn_driver() {
                Ok(driver) => arena.driver = Some(driver),
                Err(e) => {
                    arena.remove(id);
                    return Err(e.into());
                }
            }
        }
        Ok(id)
    }

    fn spawn_driver(&self) -> io::Result<Driver> {
        let (source, registrar) = Backend::open()?;
        let stop = Arc::new(AtomicBool::new(false));
        let engine = self.clone();
        let loop_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("nebula-net-io".into())
            .spawn(move || engine.run(source, &loop_stop))?;
        debug!("dispatch loop spawned");
        Ok(Driver {
            registrar,
            stop,
            thread: Some(thread),
        })
    }

    fn run(self, mut source: Backend, stop: &AtomicBool) {
        debug!("dispatch loop running");
        let mut ready = Vec::with_capacity(256);
        let mut jobs = Vec::new();
        let mut pending = false;
        while !stop.load(Ordering::Acquire) {
            ready.clear();
            let timeout = pending.then_some(Duration::ZERO);
            if let Err(e) = source.wait(&mut ready, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "event source failed, dispatch loop exiting");
                break;
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            self.collect(&ready, &mut jobs);
            pending = !jobs.is_empty();
            for job in jobs.drain(..) {
                job.dispatch(&self);
            }
        }
        debug!("dispatch loop exited");
    }

    /// Fold readiness into the cache and gather the callbacks to run.
    fn collect(&self, ready: &[Readiness], jobs: &mut Vec<Job>) {
        let mut arena = self.arena.lock();
        for event in ready {
            if event.token == WAKE_TOKEN {
                continue;
            }
            let Some(slot) = arena.slots.get_mut(event.token).and_then(Option::as_mut) else {
                continue;
            };
            slot.readable |= event.readable || event.read_closed;
            slot.writable |= event.writable || event.write_closed;
            slot.errored |= event.error;
        }

        for (index, entry) in arena.slots.iter_mut().enumerate() {
            let Some(slot) = entry else {
                continue;
            };
            let id = SocketId {
                index: index as u32,
                generation: slot.generation,
            };

            if slot.state == ConnState::ConnectStarted && (slot.writable || slot.errored) {
                slot.finish_connect(id);
            } else if slot.errored && slot.state == ConnState::Connected {
                if let SocketIo::Stream(stream) = &slot.io
                    && let Ok(Some(err)) = stream.take_error()
                {
                    debug!(socket = %id, error = %err, "socket error");
                    slot.last_error = Some(err.kind());
                    slot.fail(CloseReason::from_io(&err));
                } else {
                    slot.readable = true;
                }
            }
            slot.errored = false;

            let Some(weak) = &slot.handler else {
                continue;
            };
            let Some(handler) = weak.upgrade() else {
                slot.handler = None;
                slot.pending_close = None;
                continue;
            };

            if let Some(reason) = slot.pending_close.take() {
                jobs.push(Job::Closed(id, handler, reason));
                continue;
            }
            if slot.state != ConnState::Connected || slot.close_queued {
                continue;
            }
            if slot.readable && slot.mask.read {
                jobs.push(Job::Readable(id, Arc::clone(&handler)));
            }
            if slot.writable && slot.mask.write {
                jobs.push(Job::Writable(id, handler));
            }
        }
    }
}
