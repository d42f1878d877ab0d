//! Tracing subscriber setup for forge hosts.
//!
//! Console output is human-readable with uptime timestamps and thread names,
//! which tells the logic thread apart from the `forge-net-io` workers. An
//! optional second layer writes JSON lines to a file for later analysis.
//! `RUST_LOG` takes precedence over the configured level.

use std::fs::File;
use std::io;
use std::path::Path;

use forge_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file inside the log directory.
pub const LOG_FILE_NAME: &str = "forge.log";

/// Install the global subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `json_file` - whether to write the JSON log at all
/// * `config` - source of the default filter directive
///
/// A log file that cannot be created is reported on stderr and skipped.
/// Calling this twice in one process panics, as with any global subscriber.
///
/// ```no_run
/// use forge_config::LogConfig;
/// use forge_log::init_logging;
///
/// init_logging(None, false, Some(&LogConfig::default()));
/// ```
pub fn init_logging(log_dir: Option<&Path>, json_file: bool, config: Option<&LogConfig>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry().with(env_filter).with(console_layer);

    if json_file && let Some(dir) = log_dir {
        match open_log_file(dir) {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_timer(fmt::time::uptime())
                    .json();
                subscriber.with(file_layer).init();
                return;
            }
            Err(e) => eprintln!("forge-log: cannot open {}: {e}", dir.join(LOG_FILE_NAME).display()),
        }
    }

    subscriber.init();
}

/// Filter directive from the config, falling back to [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&LogConfig>) -> String {
    match config {
        Some(config) if !config.level.trim().is_empty() => config.level.trim().to_string(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create `log_dir` if needed and truncate `forge.log` inside it.
pub fn open_log_file(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    File::create(log_dir.join(LOG_FILE_NAME))
}
