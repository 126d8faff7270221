//! Per-platform socket setup.
//!
//! Everything that differs between Linux, macOS and Windows when creating,
//! binding or tuning a stream socket lives here: [`SocketOptions`] applied
//! through [`socket2::SockRef`], listener preparation, and the classification
//! of the "connect in progress" error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};

use crate::error::NetError;

/// Options applied to every connected stream socket and listener.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive probes. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes before the connection is declared dead (Linux/Windows only). Default: 3.
    pub keepalive_retries: u32,
    /// `SO_REUSEADDR` on listeners. Default: on everywhere except Windows,
    /// where it allows port hijacking.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

impl SocketOptions {
    /// Apply the stream options to a connected socket.
    pub fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        socket.set_nodelay(self.tcp_nodelay)?;
        if self.keepalive_enabled {
            let keepalive = TcpKeepalive::new()
                .with_time(self.keepalive_idle)
                .with_interval(self.keepalive_interval);
            #[cfg(any(target_os = "linux", target_os = "windows"))]
            let keepalive = keepalive.with_retries(self.keepalive_retries);
            socket.set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

/// Create a non-blocking TCP socket for the given address family.
pub(crate) fn new_stream_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind `socket` to `addr` and start listening.
///
/// IPv6 listeners are made dual-stack so one socket accepts both families.
pub(crate) fn listen_on(
    socket: &Socket,
    addr: SocketAddr,
    options: &SocketOptions,
) -> Result<(), NetError> {
    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        // Not every platform allows clearing IPV6_V6ONLY.
        let _ = socket.set_only_v6(false);
    }
    socket.bind(&addr.into()).map_err(NetError::from_bind)?;
    socket.listen(options.backlog)?;
    Ok(())
}

/// Whether a non-blocking `connect` error only means "still connecting".
pub(crate) fn is_connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    false
}
