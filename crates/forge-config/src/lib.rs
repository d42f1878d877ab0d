//! Configuration for forge hosts.
//!
//! Settings persist to disk as `config.ron`. Every section uses serde
//! defaults, so older or partial files keep loading as fields are added.
//! Command-line arguments override whatever was loaded.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, TransportArg};
pub use config::{Config, LogConfig, ServerConfig, default_config_dir};
pub use error::ConfigError;
