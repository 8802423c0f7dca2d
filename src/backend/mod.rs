//! The pluggable storage backend seam.
//!
//! `StorageBackend` is the async trait object every write goes through;
//! `registry` replaces the original carbon `DB_INIT_FUNC` dotted-path
//! dynamic import with a named constructor lookup, built on a process-wide
//! `once_cell::sync::OnceCell`-backed singleton table. `whisper_file` is the
//! default, in-tree implementation; the on-disk archive byte format itself
//! is abstracted behind `ArchiveFile` since the real Whisper binary format
//! is out of scope here.

pub mod flatfile;
pub mod registry;
pub mod whisper_file;

use async_trait::async_trait;

use crate::cache::Datapoint;
use crate::error::Result;
use crate::schema::{AggregationMethod, Retention};

pub use registry::{create_backend, register_backend};
pub use whisper_file::WhisperFileBackend;

/// One metric's worth of points to write in a single call.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    pub metric: String,
    pub points: Vec<Datapoint>,
}

/// Static metadata about an existing archive, as returned by carbon's
/// `info()` call (`management.py::getMetadata`).
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub aggregation_method: AggregationMethod,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub archives: Vec<Retention>,
}

/// The storage backend seam. One metric maps to one archive; `exists`/
/// `create`/`update_many` are the three calls every write path uses.
/// `batch_exists`/`batch_update_many` are opt-in: backends that can satisfy
/// many metrics in one round trip override them, otherwise the default
/// impls fall back to per-metric calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn exists(&self, metric: &str) -> Result<bool>;

    async fn create(
        &self,
        metric: &str,
        archives: &[Retention],
        x_files_factor: f32,
        aggregation_method: AggregationMethod,
    ) -> Result<()>;

    async fn update_many(&self, metric: &str, points: &[Datapoint]) -> Result<()>;

    async fn info(&self, metric: &str) -> Result<Option<ArchiveInfo>>;

    async fn set_aggregation_method(&self, metric: &str, method: AggregationMethod) -> Result<()>;

    /// Default: sequential per-metric `exists` calls.
    async fn batch_exists(&self, metrics: &[String]) -> Result<Vec<bool>> {
        let mut out = Vec::with_capacity(metrics.len());
        for metric in metrics {
            out.push(self.exists(metric).await?);
        }
        Ok(out)
    }

    /// Default: sequential per-metric `update_many` calls. Under batch
    /// error semantics, a single failing metric in the batch still
    /// counts as exactly one error for the whole call when a real batch
    /// backend overrides this; the fallback here counts per-metric since
    /// there is no single "call" to attribute the error to.
    async fn batch_update_many(&self, updates: &[BatchUpdate]) -> Result<()> {
        for update in updates {
            self.update_many(&update.metric, &update.points).await?;
        }
        Ok(())
    }
}
