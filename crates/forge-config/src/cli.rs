//! Command-line arguments for forge hosts.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use forge_net::TransportKind;

use crate::Config;

/// Framing selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Tcp,
    #[value(alias = "websocket")]
    Ws,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Tcp => TransportKind::Tcp,
            TransportArg::Ws => TransportKind::WebSocket,
        }
    }
}

/// forge server arguments.
///
/// Values given here override `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "forge-server", about = "Game server network transport host")]
pub struct CliArgs {
    /// Address to bind, or to connect to with `--client`.
    #[arg(long)]
    pub address: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Message framing.
    #[arg(long, value_enum)]
    pub transport: Option<TransportArg>,

    /// I/O worker threads.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Connection limit, 0 for unlimited.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log filter (error, warn, info, debug, trace, or a full directive).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Config directory (overrides the platform default).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Connect to a server and ping it instead of listening.
    #[arg(long)]
    pub client: bool,

    /// Stop after this many seconds instead of running until interrupted.
    #[arg(long)]
    pub run_secs: Option<u64>,
}

impl Config {
    /// Overwrite loaded settings with whatever was passed on the command line.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref address) = args.address {
            self.server.address = address.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(transport) = args.transport {
            self.server.kind = transport.into();
        }
        if let Some(threads) = args.threads {
            self.server.thread_count = threads;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
