//! Runtime configuration for the archive writer.
//!
//! Loaded from an optional TOML file plus `WRITER_*` environment overrides,
//! in a layered-source style (`config::Config::builder().add_source(...)`).
//! Every recognized configuration key is a field here.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WriterError};

const DEFAULT_MAX_CACHE_SIZE: usize = 1_000_000;
const DEFAULT_MAX_CREATES_PER_MINUTE: u32 = 50;
const DEFAULT_MAX_UPDATES_PER_SECOND: u32 = 1000;
const ENV_PREFIX: &str = "WRITER";

/// One field per recognized configuration key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// LOCAL_DATA_DIR
    pub local_data_dir: PathBuf,
    /// DB_INIT_FUNC — name of the registered backend constructor (see `backend::registry`)
    pub db_init_func: String,
    /// WHISPER_AUTOFLUSH
    pub autoflush: bool,
    /// WHISPER_FALLOCATE_CREATE
    pub fallocate_create: bool,
    /// WHISPER_LOCK_WRITES
    pub lock_writes: bool,
    /// WHISPER_SPARSE_CREATE
    pub sparse_create: bool,
    /// MAX_CACHE_SIZE
    pub max_cache_size: usize,
    /// MAX_CREATES_PER_MINUTE
    pub max_creates_per_minute: u32,
    /// MAX_UPDATES_PER_SECOND
    pub max_updates_per_second: u32,
    /// MAX_UPDATES_PER_SECOND_ON_SHUTDOWN
    pub max_updates_per_second_on_shutdown: Option<u32>,
    /// ENABLE_BATCHED_WRITES
    pub enable_batched_writes: bool,
    /// LOG_UPDATES
    pub log_updates: bool,
    /// LOG_BATCH_UPDATES
    pub log_batch_updates: bool,

    /// Path to the storage-schemas config file (required to locate what
    /// SchemaRegistry reloads every 60s).
    pub storage_schemas_path: PathBuf,
    /// Path to the storage-aggregation config file.
    pub aggregation_schemas_path: PathBuf,

    #[serde(skip)]
    pub reload_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            local_data_dir: PathBuf::from("/var/lib/archive-writer"),
            db_init_func: "whisper_file".to_string(),
            autoflush: false,
            fallocate_create: false,
            lock_writes: false,
            sparse_create: false,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_creates_per_minute: DEFAULT_MAX_CREATES_PER_MINUTE,
            max_updates_per_second: DEFAULT_MAX_UPDATES_PER_SECOND,
            max_updates_per_second_on_shutdown: None,
            enable_batched_writes: false,
            log_updates: false,
            log_batch_updates: false,
            storage_schemas_path: PathBuf::from("/etc/archive-writer/storage-schemas.conf"),
            aggregation_schemas_path: PathBuf::from("/etc/archive-writer/storage-aggregation.conf"),
            reload_interval: Duration::from_secs(60),
        }
    }
}

impl WriterConfig {
    /// Loads configuration from an optional TOML file, then applies
    /// `WRITER_*` environment variable overrides, then validates.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&WriterConfig::default()).map_err(|e| {
                WriterError::Config(format!("failed to seed defaults: {e}"))
            })?);

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("_"));

        let config: WriterConfig = builder
            .build()
            .map_err(|e| WriterError::Config(format!("failed to build config: {e}")))?
            .try_deserialize()
            .map_err(|e| WriterError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_data_dir.as_os_str().is_empty() {
            return Err(WriterError::Config("local_data_dir must not be empty".into()));
        }
        if self.max_creates_per_minute == 0 {
            return Err(WriterError::Config("max_creates_per_minute must be > 0".into()));
        }
        if self.max_updates_per_second == 0 {
            return Err(WriterError::Config("max_updates_per_second must be > 0".into()));
        }
        Ok(())
    }

    /// 95% of MAX_CACHE_SIZE — the low watermark that re-enables ingest.
    pub fn cache_low_watermark(&self) -> usize {
        (self.max_cache_size as f64 * 0.95) as usize
    }
}
