//! Configuration structs with sensible defaults and RON persistence.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener, host and peer settings.
    pub network: NetworkConfig,
    /// Logging settings.
    pub debug: DebugConfig,
}

/// Network configuration for the relay server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both listeners bind to.
    pub bind_address: String,
    /// Framed stream (TCP) listener port.
    pub stream_port: u16,
    /// Reliable UDP host port.
    pub udp_port: u16,
    /// Peer slots on the UDP host.
    pub max_peers: usize,
    /// Most channels a UDP peer may open.
    pub channel_count: usize,
    /// Incoming bandwidth in bytes per second (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes per second (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Retransmission count that arms the minimum timeout.
    pub timeout_limit: u32,
    /// Milliseconds a peer may stay silent once `timeout_limit` is reached.
    pub timeout_min_ms: u64,
    /// Milliseconds after which an unacknowledged peer is dropped regardless.
    pub timeout_max_ms: u64,
    /// Keepalive interval for idle peers, in milliseconds.
    pub ping_interval_ms: u64,
    /// LZ4-compress UDP datagrams when it saves space.
    pub compression: bool,
    /// Largest framed message body accepted on stream sockets.
    pub max_frame_payload: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log directory; relative paths are resolved against the config
    /// directory.
    pub log_dir: PathBuf,
    /// Also write JSON logs to `log_dir`.
    pub json_logs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            stream_port: 7777,
            udp_port: 7778,
            max_peers: 32,
            channel_count: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            timeout_limit: 32,
            timeout_min_ms: 5_000,
            timeout_max_ms: 30_000,
            ping_interval_ms: 500,
            compression: false,
            max_frame_payload: u16::MAX,
        }
    }
}

impl NetworkConfig {
    /// Reject settings the listeners or the UDP host cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| Err(ConfigError::InvalidNetwork { field, reason });

        if self.bind_address.parse::<IpAddr>().is_err() {
            return invalid(
                "bind_address",
                format!("{:?} is not an IP address", self.bind_address),
            );
        }
        if self.max_peers == 0 {
            return invalid("max_peers", "must allow at least one peer".into());
        }
        if self.channel_count == 0 {
            return invalid("channel_count", "must allow at least one channel".into());
        }
        if self.timeout_min_ms > self.timeout_max_ms {
            return invalid(
                "timeout_min_ms",
                format!(
                    "{} exceeds timeout_max_ms {}",
                    self.timeout_min_ms, self.timeout_max_ms
                ),
            );
        }
        if self.max_frame_payload == 0 {
            return invalid("max_frame_payload", "must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            json_logs: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Per-user config directory, `None` when the platform has none.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nebula-server"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            config.network.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::write(&path, serialized).map_err(|source| ConfigError::Write { path, source })
    }

    /// Returns `Some(new_config)` if the file on disk differs, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        new_config.network.validate()?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Log directory, anchored at `config_dir` when relative.
    pub fn log_dir(&self, config_dir: &Path) -> PathBuf {
        if self.debug.log_dir.is_absolute() {
            self.debug.log_dir.clone()
        } else {
            config_dir.join(&self.debug.log_dir)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("stream_port: 7777"));
        assert!(ron_str.contains("udp_port: 7778"));
        assert!(ron_str.contains("log_level: \"info\""));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (udp_port: 9000))").unwrap();
        assert_eq!(config.network.udp_port, 9000);
        assert_eq!(config.network.stream_port, 7777);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.max_peers = 4;
        config.network.compression = true;
        config.debug.json_logs = true;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.network.ping_interval_ms = 250;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.network.ping_interval_ms, 250);
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "(network: (udp_port: -1))").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(err.to_string().contains("config.ron"), "{err}");
    }

    #[test]
    fn test_bad_bind_address_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ron"),
            "(network: (bind_address: \"example.com\"))",
        )
        .unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::InvalidNetwork {
                field: "bind_address",
                ..
            })
        ));
    }

    #[test]
    fn test_network_validation() {
        assert!(NetworkConfig::default().validate().is_ok());

        let no_channels = NetworkConfig {
            channel_count: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            no_channels.validate(),
            Err(ConfigError::InvalidNetwork {
                field: "channel_count",
                ..
            })
        ));

        let inverted = NetworkConfig {
            timeout_min_ms: 40_000,
            ..NetworkConfig::default()
        };
        let err = inverted.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid network.timeout_min_ms: 40000 exceeds timeout_max_ms 30000"
        );
    }

    #[test]
    fn test_log_dir_resolution() {
        let mut config = Config::default();
        let base = Path::new("/etc/nebula");
        assert_eq!(config.log_dir(base), base.join("logs"));

        let absolute = std::env::temp_dir().join("nebula-logs");
        config.debug.log_dir = absolute.clone();
        assert_eq!(config.log_dir(base), absolute);
    }
}
