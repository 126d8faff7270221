//! Host name resolution used by [`StreamSocket::begin_connect`](crate::StreamSocket::begin_connect).

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::NetError;

/// Turns a host name and port into candidate addresses.
///
/// Called on the connect helper thread, so implementations may block.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetError::HostNotFound(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::HostNotFound(host.to_string()));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_host_resolves_without_lookup() {
        let addrs = SystemResolver.resolve("127.0.0.1", 7777).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:7777".parse().unwrap()]);
    }

    #[test]
    fn test_unresolvable_host_is_host_not_found() {
        let err = SystemResolver
            .resolve("no-such-host.invalid", 7777)
            .unwrap_err();
        assert!(matches!(err, NetError::HostNotFound(ref h) if h == "no-such-host.invalid"));
    }
}
