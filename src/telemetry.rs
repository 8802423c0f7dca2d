//! Logging and metrics-instrumentation setup.
//!
//! A single daily-rotating file appender wired through
//! `tracing_subscriber::registry()`, configured once at startup.
//!
//! Instrumentation counters use the `metrics` crate facade; this crate does
//! not install a concrete recorder (statsd, prometheus, ...) — that's left
//! to whatever binary embeds it, matching `metrics`'s intended usage
//! pattern.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, WriterError};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub file_name_prefix: String,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name_prefix: "archive-writer.log".to_string(),
            json_format: false,
        }
    }
}

/// Initializes the global tracing subscriber. Returns a `WorkerGuard` that
/// must be held for the process lifetime — dropping it stops the
/// non-blocking writer from flushing.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.directory)
        .map_err(|e| WriterError::io(config.directory.clone(), e))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &config.directory, &config.file_name_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_json(config.json_format);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| WriterError::Config(format!("failed to install tracing subscriber: {e}")))?;

    Ok(guard)
}

/// Thin wrappers around the `metrics` facade macros, named for the five
/// counters/histograms this crate tracks.
pub mod instrumentation {
    /// A new archive file was created on disk.
    pub fn record_create() {
        metrics::counter!("archive_writer.creates").increment(1);
    }

    /// A backend operation failed and was absorbed rather than propagated.
    pub fn record_error() {
        metrics::counter!("archive_writer.errors").increment(1);
    }

    /// `n` datapoints were successfully committed to storage.
    pub fn record_committed_points(n: u64) {
        metrics::counter!("archive_writer.committedPoints").increment(n);
    }

    /// Wall-clock duration, in seconds, of a single metric's update call.
    pub fn record_update_time(seconds: f64) {
        metrics::histogram!("archive_writer.updateTimes").record(seconds);
    }

    /// Number of metrics included in one batched update call.
    pub fn record_batch_size(size: u64) {
        metrics::histogram!("archive_writer.batchSizes").record(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_config_uses_relative_logs_dir() {
        assert_eq!(LogConfig::default().directory, PathBuf::from("logs"));
    }
}
