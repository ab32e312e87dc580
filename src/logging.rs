//! Tracing setup for the CLI and the server.
//!
//! Diagnostics go to stderr, filtered by `RUST_LOG` (default `pipewright=info`).
//! With a log directory configured, a JSON copy is also written to a daily
//! rotated file. Run artifacts and event journals are separate and never
//! depend on the log level.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "pipewright=info";
const LOG_FILE_PREFIX: &str = "pipewright.log";

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
///
/// # Example
/// ```bash
/// RUST_LOG=pipewright=debug pipewright serve
/// ```
pub fn init(format: LogFormat, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (compact, json) = match format {
        LogFormat::Compact => (
            Some(fmt::layer().with_writer(std::io::stderr).compact()),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().with_writer(std::io::stderr).json()),
        ),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false).json()),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(compact)
        .with(json)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only test in the crate that installs the global subscriber.
    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let guard = init(LogFormat::Json, Some(&log_dir)).unwrap();
        assert!(guard.is_some());
        assert!(log_dir.is_dir());
    }
}
