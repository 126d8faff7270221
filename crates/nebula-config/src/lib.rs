//! Configuration for the Nebula transport.
//!
//! Settings persist to disk as RON and can be overridden from the command
//! line. Libraries never read this directly; the server binary turns it into
//! the transport constructor structs.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig};
pub use error::ConfigError;
