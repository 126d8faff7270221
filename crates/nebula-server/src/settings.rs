//! Conversion from the persisted configuration to transport constructor
//! structs.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use nebula_config::NetworkConfig;
use nebula_net::{FrameConfig, MessageSocketConfig};
use nebula_rudp::HostConfig;
use nebula_rudp::protocol::MAX_CHANNELS;

use crate::error::ServerError;

fn bind_ip(network: &NetworkConfig) -> Result<IpAddr, ServerError> {
    network
        .bind_address
        .parse()
        .map_err(|_| ServerError::InvalidAddress(network.bind_address.clone()))
}

pub fn stream_addr(network: &NetworkConfig) -> Result<SocketAddr, ServerError> {
    Ok(SocketAddr::new(bind_ip(network)?, network.stream_port))
}

pub fn udp_addr(network: &NetworkConfig) -> Result<SocketAddr, ServerError> {
    Ok(SocketAddr::new(bind_ip(network)?, network.udp_port))
}

pub fn host_config(network: &NetworkConfig) -> HostConfig {
    HostConfig {
        peer_count: network.max_peers,
        channel_limit: network.channel_count.clamp(1, MAX_CHANNELS),
        incoming_bandwidth: network.incoming_bandwidth,
        outgoing_bandwidth: network.outgoing_bandwidth,
        timeout_limit: network.timeout_limit,
        timeout_minimum: Duration::from_millis(network.timeout_min_ms),
        timeout_maximum: Duration::from_millis(network.timeout_max_ms),
        ping_interval: Duration::from_millis(network.ping_interval_ms),
        compress: network.compression,
        ..HostConfig::default()
    }
}

pub fn socket_config(network: &NetworkConfig) -> MessageSocketConfig {
    MessageSocketConfig {
        frame: FrameConfig {
            max_payload_size: network.max_frame_payload,
        },
        ..MessageSocketConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_from_config() {
        let network = NetworkConfig {
            bind_address: "127.0.0.1".into(),
            stream_port: 1000,
            udp_port: 1001,
            ..NetworkConfig::default()
        };
        assert_eq!(stream_addr(&network).unwrap(), "127.0.0.1:1000".parse().unwrap());
        assert_eq!(udp_addr(&network).unwrap(), "127.0.0.1:1001".parse().unwrap());
    }

    #[test]
    fn test_bad_bind_address() {
        let network = NetworkConfig {
            bind_address: "not-an-ip".into(),
            ..NetworkConfig::default()
        };
        assert!(matches!(
            stream_addr(&network),
            Err(ServerError::InvalidAddress(addr)) if addr == "not-an-ip"
        ));
    }

    #[test]
    fn test_host_config_mapping() {
        let network = NetworkConfig {
            max_peers: 8,
            channel_count: 0,
            timeout_min_ms: 1_000,
            ping_interval_ms: 100,
            compression: true,
            ..NetworkConfig::default()
        };
        let host = host_config(&network);
        assert_eq!(host.peer_count, 8);
        assert_eq!(host.channel_limit, 1);
        assert_eq!(host.timeout_minimum, Duration::from_secs(1));
        assert_eq!(host.ping_interval, Duration::from_millis(100));
        assert!(host.compress);
    }

    #[test]
    fn test_socket_config_mapping() {
        let network = NetworkConfig {
            max_frame_payload: 512,
            ..NetworkConfig::default()
        };
        assert_eq!(socket_config(&network).frame.max_payload_size, 512);
    }
}
