//! Asynchronous stream socket on top of the [`SocketEngine`].
//!
//! A [`StreamSocket`] allows one outstanding read and one outstanding write.
//! Each request hands an owned buffer to the socket; the buffer comes back in
//! `on_read_complete`/`on_write_complete` once exactly the requested number of
//! bytes has been transferred, however many readiness callbacks that takes.
//!
//! Lock order: operation context, then engine arena.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::engine::{OpMask, Protocol, SocketEngine, SocketHandler, SocketId};
use crate::error::{CloseReason, NetError};
use crate::platform::SocketOptions;
use crate::resolve::Resolver;

/// Completion callbacks of a [`StreamSocket`]. Called on the engine thread,
/// except `on_connect_complete` after [`StreamSocket::begin_connect`], which
/// runs on the connect helper thread.
pub trait StreamHandler: Send + Sync {
    fn on_connect_complete(&self, _result: Result<(), NetError>) {}

    /// A read finished; `buf` holds exactly the requested bytes.
    fn on_read_complete(&self, _buf: Vec<u8>) {}

    /// A write finished; `buf` is the buffer that was handed in.
    fn on_write_complete(&self, _buf: Vec<u8>) {}

    /// The connection ended because of the peer or an error. Not called for
    /// [`StreamSocket::close`].
    fn on_close(&self, _reason: CloseReason) {}
}

/// Callback for [`StreamListener`]. The accepted socket must be wrapped with
/// [`StreamSocket::from_accepted`] or destroyed.
pub trait ListenHandler: Send + Sync {
    fn on_accept(&self, engine: &SocketEngine, id: SocketId, peer: SocketAddr);
}

// ---------------------------------------------------------------------------
// Operation context
// ---------------------------------------------------------------------------

/// State of one in-flight read or write.
#[derive(Debug, Default)]
pub(crate) struct Operation {
    active: bool,
    buf: Vec<u8>,
    requested: usize,
    completed: usize,
}

/// Result of pushing an operation forward.
#[derive(Debug)]
pub(crate) enum Progress {
    /// More bytes are needed; wait for the next readiness callback.
    Pending,
    /// All requested bytes moved; the buffer is handed back.
    Complete(Vec<u8>),
}

impl Operation {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn start(&mut self, buf: Vec<u8>, requested: usize) -> Result<(), NetError> {
        if self.active {
            return Err(NetError::ConflictingOperationInProgress);
        }
        self.active = true;
        self.buf = buf;
        self.requested = requested;
        self.completed = 0;
        Ok(())
    }

    /// Move bytes with `transfer` until the request is satisfied or
    /// `transfer` reports that nothing more can move right now (`Ok(0)`).
    pub(crate) fn progress(
        &mut self,
        mut transfer: impl FnMut(&mut [u8]) -> Result<usize, NetError>,
    ) -> Result<Progress, NetError> {
        while self.completed < self.requested {
            match transfer(&mut self.buf[self.completed..self.requested]) {
                Ok(0) => return Ok(Progress::Pending),
                Ok(n) => self.completed += n,
                Err(e) => {
                    self.cancel();
                    return Err(e);
                }
            }
        }
        self.active = false;
        let mut buf = std::mem::take(&mut self.buf);
        buf.truncate(self.requested);
        Ok(Progress::Complete(buf))
    }

    pub(crate) fn cancel(&mut self) {
        self.active = false;
        self.buf = Vec::new();
        self.requested = 0;
        self.completed = 0;
    }
}

// ---------------------------------------------------------------------------
// Stream socket
// ---------------------------------------------------------------------------

struct StreamCore {
    engine: SocketEngine,
    id: Mutex<Option<SocketId>>,
    handler: Arc<dyn StreamHandler>,
    reader: Mutex<Operation>,
    writer: Mutex<Operation>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl StreamCore {
    fn new(engine: &SocketEngine, handler: Arc<dyn StreamHandler>) -> Arc<Self> {
        Arc::new(Self {
            engine: engine.clone(),
            id: Mutex::new(None),
            handler,
            reader: Mutex::new(Operation::default()),
            writer: Mutex::new(Operation::default()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn id(&self) -> Option<SocketId> {
        *self.id.lock()
    }

    /// Hand a socket to the engine with this core as its handler.
    fn attach(self: &Arc<Self>, id: SocketId) -> Result<(), NetError> {
        let weak: Weak<dyn SocketHandler> = Arc::downgrade(self) as Weak<dyn SocketHandler>;
        self.engine.set_handler(id, weak)?;
        *self.id.lock() = Some(id);
        Ok(())
    }

    /// Arm the op mask for whatever was requested before the socket existed.
    fn arm_pending(&self, id: SocketId) -> Result<(), NetError> {
        let read = self.reader.lock().is_active();
        let write = self.writer.lock().is_active();
        self.engine
            .update_op_mask(id, |mask| {
                mask.read |= read;
                mask.write |= write;
            })
            .map(|_| ())
    }

    fn disarm(&self, id: SocketId, read: bool) {
        let _ = self.engine.update_op_mask(id, |mask| {
            if read {
                mask.read = false;
            } else {
                mask.write = false;
            }
        });
    }

    fn connect_failed(&self, reason: String) -> NetError {
        let kind = self
            .id()
            .and_then(|id| self.engine.last_error(id).ok().flatten())
            .unwrap_or(io::ErrorKind::ConnectionRefused);
        NetError::Io(io::Error::new(kind, reason))
    }
}

impl SocketHandler for StreamCore {
    fn on_readable(&self, engine: &SocketEngine, id: SocketId) {
        let outcome = {
            let mut reader = self.reader.lock();
            if !reader.is_active() {
                self.disarm(id, true);
                return;
            }
            let outcome = reader.progress(|buf| engine.read(id, buf));
            if !matches!(outcome, Ok(Progress::Pending)) {
                self.disarm(id, true);
            }
            outcome
        };
        match outcome {
            Ok(Progress::Complete(buf)) => {
                trace!(socket = %id, bytes = buf.len(), "read complete");
                self.handler.on_read_complete(buf);
            }
            Ok(Progress::Pending) => {}
            Err(e) => trace!(socket = %id, error = %e, "read aborted"),
        }
    }

    fn on_writable(&self, engine: &SocketEngine, id: SocketId) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!(socket = %id, "stream connected");
            if let Err(e) = engine.configure(id, &SocketOptions::default()) {
                warn!(socket = %id, error = %e, "failed to apply socket options");
            }
            self.handler.on_connect_complete(Ok(()));
        }
        let outcome = {
            let mut writer = self.writer.lock();
            if !writer.is_active() {
                self.disarm(id, false);
                return;
            }
            let outcome = writer.progress(|buf| engine.write(id, buf));
            if !matches!(outcome, Ok(Progress::Pending)) {
                self.disarm(id, false);
            }
            outcome
        };
        match outcome {
            Ok(Progress::Complete(buf)) => {
                trace!(socket = %id, bytes = buf.len(), "write complete");
                self.handler.on_write_complete(buf);
            }
            Ok(Progress::Pending) => {}
            Err(e) => trace!(socket = %id, error = %e, "write aborted"),
        }
    }

    fn on_closed(&self, _engine: &SocketEngine, id: SocketId, reason: CloseReason) {
        self.closed.store(true, Ordering::Release);
        self.reader.lock().cancel();
        self.writer.lock().cancel();
        match reason {
            CloseReason::Local => debug!(socket = %id, "stream closed locally"),
            CloseReason::ConnectFailed(message) if !self.connected.load(Ordering::Acquire) => {
                debug!(socket = %id, %message, "stream connect failed");
                self.handler
                    .on_connect_complete(Err(self.connect_failed(message)));
            }
            reason => {
                debug!(socket = %id, %reason, "stream closed");
                self.handler.on_close(reason);
            }
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if let Some(id) = self.id.get_mut().take() {
            self.engine.destroy(id);
        }
    }
}

/// Non-blocking stream socket with single outstanding read and write.
///
/// Dropping the socket destroys the underlying engine socket.
pub struct StreamSocket {
    core: Arc<StreamCore>,
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket")
            .field("id", &self.core.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl StreamSocket {
    /// Resolve `host` and connect on a helper thread. Returns at once;
    /// `on_connect_complete` reports the outcome, including
    /// [`NetError::HostNotFound`].
    pub fn begin_connect(
        engine: &SocketEngine,
        host: &str,
        port: u16,
        handler: Arc<dyn StreamHandler>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self, NetError> {
        let core = StreamCore::new(engine, handler);
        let weak = Arc::downgrade(&core);
        let host = host.to_string();
        thread::Builder::new()
            .name("nebula-connect".into())
            .spawn(move || connect_worker(weak, &host, port, resolver.as_ref()))?;
        Ok(Self { core })
    }

    /// Non-blocking connect driven by the engine. Completion is reported on
    /// the first writable event.
    pub fn connect(
        engine: &SocketEngine,
        addr: SocketAddr,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Self, NetError> {
        let protocol = if addr.is_ipv6() {
            Protocol::Tcp6
        } else {
            Protocol::Tcp
        };
        let id = engine.initialize(protocol)?;
        let core = StreamCore::new(engine, handler);
        core.attach(id)?;
        engine.set_op_mask(id, OpMask::WRITE)?;
        engine.connect(id, addr)?;
        Ok(Self { core })
    }

    /// Wrap a connected socket produced by a [`StreamListener`].
    pub fn from_accepted(
        engine: &SocketEngine,
        id: SocketId,
        handler: Arc<dyn StreamHandler>,
        options: &SocketOptions,
    ) -> Result<Self, NetError> {
        let core = StreamCore::new(engine, handler);
        core.connected.store(true, Ordering::Release);
        core.attach(id)?;
        if let Err(e) = engine.configure(id, options) {
            warn!(socket = %id, error = %e, "failed to apply socket options");
        }
        Ok(Self { core })
    }

    /// Read exactly `len` bytes into `buf` (grown if shorter).
    pub fn read(&self, mut buf: Vec<u8>, len: usize) -> Result<(), NetError> {
        if len == 0 {
            return Err(invalid_length());
        }
        if self.core.closed.load(Ordering::Acquire) {
            return Err(NetError::ConnectionBroken);
        }
        if buf.len() < len {
            buf.resize(len, 0);
        }
        let mut reader = self.core.reader.lock();
        reader.start(buf, len)?;
        if let Some(id) = self.core.id() {
            self.core.engine.update_op_mask(id, |mask| mask.read = true)?;
        }
        Ok(())
    }

    /// Write the first `len` bytes of `buf`.
    pub fn write(&self, buf: Vec<u8>, len: usize) -> Result<(), NetError> {
        if len == 0 || len > buf.len() {
            return Err(invalid_length());
        }
        if self.core.closed.load(Ordering::Acquire) {
            return Err(NetError::ConnectionBroken);
        }
        let mut writer = self.core.writer.lock();
        writer.start(buf, len)?;
        if let Some(id) = self.core.id()
            && self.is_connected()
        {
            self.core
                .engine
                .update_op_mask(id, |mask| mask.write = true)?;
        }
        Ok(())
    }

    /// Close locally. No `on_close` is delivered for a local close.
    pub fn close(&self) -> Result<(), NetError> {
        self.core.closed.store(true, Ordering::Release);
        match self.core.id() {
            Some(id) => self.core.engine.shutdown(id),
            None => Ok(()),
        }
    }

    /// Apply socket options to the connected socket.
    pub fn configure(&self, options: &SocketOptions) -> Result<(), NetError> {
        let id = self.core.id().ok_or(NetError::NotConnected)?;
        self.core.engine.configure(id, options)
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    pub fn is_reading(&self) -> bool {
        self.core.reader.lock().is_active()
    }

    pub fn is_writing(&self) -> bool {
        self.core.writer.lock().is_active()
    }

    /// Engine handle, once the socket exists.
    pub fn id(&self) -> Option<SocketId> {
        self.core.id()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        let id = self.core.id().ok_or(NetError::NotConnected)?;
        self.core.engine.peer_addr(id)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        let id = self.core.id().ok_or(NetError::NotConnected)?;
        self.core.engine.local_addr(id)
    }
}

fn invalid_length() -> NetError {
    NetError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        "transfer length must be non-zero and fit the buffer",
    ))
}

/// Body of the `nebula-connect` helper thread.
fn connect_worker(core: Weak<StreamCore>, host: &str, port: u16, resolver: &dyn Resolver) {
    let connected = resolver.resolve(host, port).and_then(|addrs| {
        trace!(host, port, candidates = addrs.len(), "resolved");
        std::net::TcpStream::connect(&addrs[..]).map_err(NetError::from)
    });

    // The socket may have been dropped while we were blocked.
    let Some(core) = core.upgrade() else {
        return;
    };
    if core.closed.load(Ordering::Acquire) {
        return;
    }
    let result = connected.and_then(|stream| {
        let peer = stream.peer_addr().ok();
        let id = core.engine.adopt(stream)?;
        if let Err(e) = core.attach(id) {
            core.engine.destroy(id);
            return Err(e);
        }
        if let Err(e) = core.engine.configure(id, &SocketOptions::default()) {
            warn!(socket = %id, error = %e, "failed to apply socket options");
        }
        core.connected.store(true, Ordering::Release);
        core.arm_pending(id)?;
        debug!(socket = %id, host, ?peer, "stream connected");
        Ok(())
    });
    if let Err(e) = &result {
        debug!(host, port, error = %e, "connect failed");
    }
    core.handler.on_connect_complete(result);
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct ListenerCore {
    engine: SocketEngine,
    id: SocketId,
    handler: Arc<dyn ListenHandler>,
}

impl SocketHandler for ListenerCore {
    fn on_readable(&self, engine: &SocketEngine, id: SocketId) {
        loop {
            match engine.accept(id) {
                Ok(Some((accepted, peer))) => self.handler.on_accept(engine, accepted, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(listener = %id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

impl Drop for ListenerCore {
    fn drop(&mut self) {
        self.engine.destroy(self.id);
    }
}

/// Listening stream socket. Accepts on the engine thread.
pub struct StreamListener {
    core: Arc<ListenerCore>,
}

impl StreamListener {
    /// Bind with default [`SocketOptions`].
    pub fn bind(
        engine: &SocketEngine,
        addr: SocketAddr,
        handler: Arc<dyn ListenHandler>,
    ) -> Result<Self, NetError> {
        Self::bind_with(engine, addr, handler, &SocketOptions::default())
    }

    pub fn bind_with(
        engine: &SocketEngine,
        addr: SocketAddr,
        handler: Arc<dyn ListenHandler>,
        options: &SocketOptions,
    ) -> Result<Self, NetError> {
        let protocol = if addr.is_ipv6() {
            Protocol::Tcp6
        } else {
            Protocol::Tcp
        };
        let id = engine.initialize(protocol)?;
        let core = Arc::new(ListenerCore {
            engine: engine.clone(),
            id,
            handler,
        });
        engine.bind_with(id, addr, options)?;
        let weak: Weak<dyn SocketHandler> = Arc::downgrade(&core) as Weak<dyn SocketHandler>;
        engine.set_handler(id, weak)?;
        engine.set_op_mask(id, OpMask::READ)?;
        Ok(Self { core })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.core.engine.local_addr(self.core.id)
    }

    pub fn id(&self) -> SocketId {
        self.core.id
    }
}
