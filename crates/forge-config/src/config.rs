//! Host settings and their RON persistence.

use std::path::{Path, PathBuf};

use forge_net::{ClientOptions, ServerOptions, TransportConfig, TransportKind};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const FILE_NAME: &str = "config.ron";

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Endpoint and tick settings.
    pub server: ServerConfig,
    /// Transport tuning passed straight to [`forge_net::Transport`].
    pub transport: TransportConfig,
    /// Log output.
    pub log: LogConfig,
}

/// Where to listen (or connect) and how fast to tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, or the server address in client mode.
    pub address: String,
    pub port: u16,
    /// Message framing.
    pub kind: TransportKind,
    /// I/O worker threads.
    pub thread_count: usize,
    /// Connection limit, 0 for unlimited.
    pub max_connections: usize,
    pub ipv6: bool,
    /// Logic ticks per second.
    pub tick_rate_hz: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 7777,
            kind: TransportKind::Tcp,
            thread_count: 2,
            max_connections: 1024,
            ipv6: false,
            tick_rate_hz: 30,
        }
    }
}

impl ServerConfig {
    /// Options for starting a listening transport.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            address: self.address.clone(),
            port: self.port,
            thread_count: self.thread_count,
            max_connections: self.max_connections,
            ipv6: self.ipv6,
        }
    }

    /// Options for connecting to `address:port`.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            address: self.address.clone(),
            port: self.port,
            ipv6: self.ipv6,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"info,forge_net=debug"`.
    pub level: String,
    /// Also write JSON lines to `forge.log` under the log directory.
    pub json_file: bool,
    /// Directory for the JSON log. Defaults to the config directory.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            dir: None,
        }
    }
}

/// Platform config location, e.g. `~/.config/forge` on Linux.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("forge")
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults first if it
    /// does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(FILE_NAME);

        if path.exists() {
            let config = Self::read(&path)?;
            log::info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", path.display());
            Ok(config)
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

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: config_dir.join(FILE_NAME),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(config_dir.join(FILE_NAME), serialized).map_err(write_err)
    }

    /// Re-read the file. Returns `Some` only if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&config_dir.join(FILE_NAME))?;
        if &fresh == self {
            Ok(None)
        } else {
            log::info!("Config reloaded with changes");
            Ok(Some(fresh))
        }
    }
}
