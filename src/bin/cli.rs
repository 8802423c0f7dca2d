//! Process entry point: loads configuration, wires the writer subsystem
//! together, and runs it until SIGINT/SIGTERM.
//!
//! There is no command registry or sub-command surface here, just "start
//! the writer and keep it running."

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use archive_writer::backend::create_backend;
use archive_writer::config::WriterConfig;
use archive_writer::events::CacheEvents;
use archive_writer::lifecycle::LifecycleService;
use archive_writer::schema::SchemaRegistry;
use archive_writer::telemetry::{self, LogConfig};
use archive_writer::MetricCache;

#[derive(Parser, Debug)]
#[command(name = "archive-writer", version, about = "Metric archive write-scheduling daemon")]
struct Cli {
    /// Path to a TOML configuration file. Missing keys fall back to defaults
    /// and `WRITER_*` environment variables.
    #[arg(long, env = "ARCHIVE_WRITER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for rotating log files.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig { directory: cli.log_dir, json_format: cli.json_logs, ..LogConfig::default() };
    let _guard = telemetry::init_logging(&log_config)?;

    let config = WriterConfig::load(cli.config)?;
    info!(version = archive_writer::VERSION, data_dir = %config.local_data_dir.display(), "starting archive writer");

    let schemas = Arc::new(SchemaRegistry::load(
        config.storage_schemas_path.clone(),
        config.aggregation_schemas_path.clone(),
    )?);
    let backend = create_backend(&config)?;
    let cache = MetricCache::new();
    let events = CacheEvents::new();

    let service = LifecycleService::start(config, cache, backend, schemas, events);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining and stopping");
    service.stop();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
