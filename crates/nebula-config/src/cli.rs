//! Command-line argument parsing for the relay server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Relay server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-server", about = "Nebula relay server")]
pub struct CliArgs {
    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind both listeners to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Framed stream (TCP) port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Reliable UDP port.
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Peer slots on the UDP host.
    #[arg(long)]
    pub peers: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.stream_port = port;
        }
        if let Some(port) = args.udp_port {
            self.network.udp_port = port;
        }
        if let Some(peers) = args.peers {
            self.network.max_peers = peers;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
