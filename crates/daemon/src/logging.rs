//! Tracing setup for the daemon and CLI.
//!
//! Logs go to stderr by default. A daemon started with a log directory writes
//! to an hourly rolling file through a non-blocking writer instead; the
//! returned guard must stay alive for buffered lines to be flushed.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// File name prefix of rolling log files.
const LOG_FILE_PREFIX: &str = "ptymux.log";

/// Returns the filter directive for a configured level.
///
/// `verbose` raises the level to at least `debug`.
pub fn filter_directive(level: &str, verbose: bool) -> String {
    let level = level.to_lowercase();
    if verbose && !matches!(level.as_str(), "debug" | "trace") {
        "debug".to_string()
    } else {
        level
    }
}

/// Builds the filter, preferring `RUST_LOG` when it is set.
fn env_filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)))
}

/// Installs the global subscriber.
///
/// With `log_dir` set, logs roll hourly in that directory and the returned
/// guard flushes them on drop.
pub fn init(level: &str, verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(level, verbose);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::hourly(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;
            Ok(None)
        }
    }
}
