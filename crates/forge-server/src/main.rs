//! forge host binary.
//!
//! Serves an echo endpoint by default. With `--client` it connects to a
//! server and pings it once per second instead.
//!
//! Run with: `cargo run -p forge-server -- --port 7777 --transport ws`

mod handler;

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use forge_config::{CliArgs, Config, default_config_dir};
use forge_net::{NetError, NetHandler, Transport};
use tracing::{error, info};

use crate::handler::{EchoHandler, PingHandler};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}; continuing with defaults");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    let log_dir = config.log.dir.clone().unwrap_or_else(|| config_dir.join("logs"));
    forge_log::init_logging(Some(&log_dir), config.log.json_file, Some(&config.log));

    let run_for = args.run_secs.map(Duration::from_secs);
    let result = if args.client {
        run_client(&config, run_for)
    } else {
        run_server(&config, run_for)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_server(config: &Config, run_for: Option<Duration>) -> Result<(), NetError> {
    let mut transport = Transport::new(config.server.kind, config.transport.clone(), EchoHandler::default());
    transport.start_server(config.server.server_options())?;

    run_ticks(&mut transport, config.server.tick_rate_hz, run_for, |_| false);

    let stats = transport.stats();
    transport.shutdown();
    transport.update();
    info!(
        "Served {} messages in, {} out ({} connections accepted, {} rejected, {} queue drops)",
        stats.messages_in,
        stats.messages_out,
        stats.connections_accepted,
        stats.connections_rejected,
        stats.queue.dropped
    );
    Ok(())
}

fn run_client(config: &Config, run_for: Option<Duration>) -> Result<(), NetError> {
    let handler = PingHandler::new(Duration::from_secs(1));
    let mut transport = Transport::new(config.server.kind, config.transport.clone(), handler);
    transport.start_client(config.server.client_options())?;

    run_ticks(&mut transport, config.server.tick_rate_hz, run_for, |transport| {
        let outbox = transport.outbox();
        let handler = transport.handler_mut();
        handler.tick(&outbox);
        handler.closed
    });

    transport.shutdown();
    let handler = transport.handler();
    info!("Sent {} pings, {} replies", handler.sent, handler.replies);
    Ok(())
}

/// Drive `update` at a fixed rate until `run_for` elapses or `tick` returns true.
fn run_ticks<H: NetHandler>(
    transport: &mut Transport<H>,
    tick_rate_hz: u32,
    run_for: Option<Duration>,
    mut tick: impl FnMut(&mut Transport<H>) -> bool,
) {
    let period = Duration::from_secs(1) / tick_rate_hz.max(1);
    let started = Instant::now();
    let mut next = started;

    loop {
        transport.update();
        if tick(transport) {
            break;
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Run time elapsed, stopping");
            break;
        }

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}
