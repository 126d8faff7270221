//! Nebula relay server.
//!
//! Accepts framed stream clients and reliable-UDP peers, registers each as a
//! session, relays chat between them and answers pings.

mod error;
mod relay;
mod server;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use nebula_net::SocketEngine;
use tracing::{error, info};

use crate::server::Server;

/// Longest the main loop waits for UDP traffic before polling sessions.
const TICK: Duration = Duration::from_millis(10);

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config.log_dir(&config_dir);
    nebula_log::init_logging(Some(&log_dir), config.debug.json_logs, Some(&config));

    if let Err(e) = config.network.validate() {
        error!(error = %e, "refusing to start");
        return ExitCode::FAILURE;
    }

    let engine = SocketEngine::new();
    let mut server = match Server::bind(&engine, &config.network) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start relay server");
            return ExitCode::FAILURE;
        }
    };
    info!(
        stream = ?server.stream_addr().ok(),
        udp = %server.udp_addr(),
        peers = config.network.max_peers,
        "relay server listening"
    );

    match server.run(TICK) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, sessions = server.sessions().len(), "relay server stopped");
            ExitCode::FAILURE
        }
    }
}
