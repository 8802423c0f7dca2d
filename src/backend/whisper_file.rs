//! Default `StorageBackend`: one archive file per metric under a data
//! directory root, mapping dotted metric names to paths the way carbon's
//! `whisperdb.py::WhisperDatabase._getFilesystemPath` does — dots become
//! path separators, the result gets a fixed suffix, and any leading
//! separator in the metric name is stripped so it can't escape the root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::flatfile::{ArchiveFile, FlatFile};
use crate::backend::{ArchiveInfo, StorageBackend};
use crate::cache::Datapoint;
use crate::config::WriterConfig;
use crate::error::Result;
use crate::schema::{AggregationMethod, Retention};

const ARCHIVE_SUFFIX: &str = ".wsp";

fn metric_to_path(data_dir: &Path, metric: &str) -> PathBuf {
    let relative = metric.trim_start_matches(std::path::MAIN_SEPARATOR).replace('.', "/");
    data_dir.join(format!("{relative}{ARCHIVE_SUFFIX}"))
}

pub struct WhisperFileBackend {
    data_dir: PathBuf,
    autoflush: bool,
    fallocate_create: bool,
    lock_writes: bool,
    sparse_create: bool,
    /// Serializes access per archive file; a real Whisper implementation
    /// would rely on `flock` alone, but the flatfile format isn't safe for
    /// concurrent readers/writers without this.
    locks: Mutex<std::collections::HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WhisperFileBackend {
    pub fn new(config: &WriterConfig) -> Self {
        Self {
            data_dir: config.local_data_dir.clone(),
            autoflush: config.autoflush,
            fallocate_create: config.fallocate_create,
            lock_writes: config.lock_writes,
            sparse_create: config.sparse_create,
            locks: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn path_for(&self, metric: &str) -> PathBuf {
        metric_to_path(&self.data_dir, metric)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks.lock().entry(path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// `WHISPER_LOCK_WRITES` advisory-locks the file for the duration of a
    /// write using `fs4`, matching carbon's optional `flock()` wrapping of
    /// `whisper.update_many`.
    fn with_file_lock<T>(&self, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.lock_writes {
            return f();
        }
        use fs4::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| crate::error::WriterError::io(path.to_path_buf(), e))?;
        file.lock_exclusive().map_err(|e| crate::error::WriterError::io(path.to_path_buf(), e))?;
        let result = f();
        let _ = file.unlock();
        result
    }
}

#[async_trait]
impl StorageBackend for WhisperFileBackend {
    async fn exists(&self, metric: &str) -> Result<bool> {
        Ok(self.path_for(metric).is_file())
    }

    async fn create(
        &self,
        metric: &str,
        archives: &[Retention],
        x_files_factor: f32,
        aggregation_method: AggregationMethod,
    ) -> Result<()> {
        let path = self.path_for(metric);

        if self.fallocate_create {
            debug!(metric, "WHISPER_FALLOCATE_CREATE set; flatfile backend allocates lazily, no-op");
        }
        if self.sparse_create {
            debug!(metric, "WHISPER_SPARSE_CREATE set; flatfile backend has no fixed-size archive to sparsify");
        }

        match FlatFile::create(&path, archives, x_files_factor, aggregation_method) {
            Ok(()) => Ok(()),
            // A concurrent create from another process racing us to the same
            // path is treated as success, as carbon's writer.py does for EEXIST.
            Err(crate::error::WriterError::Io { source, .. }) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(metric, "archive already exists, treating concurrent create as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_many(&self, metric: &str, points: &[Datapoint]) -> Result<()> {
        let path = self.path_for(metric);
        let file_lock = self.lock_for(&path);
        let _guard = file_lock.lock();

        self.with_file_lock(&path, || {
            let mut archive = FlatFile::open(&path)?;
            archive.update_many(points)?;
            Ok(())
        })?;

        if self.autoflush {
            debug!(metric, "WHISPER_AUTOFLUSH set; flatfile backend writes are unbuffered already");
        }
        Ok(())
    }

    async fn info(&self, metric: &str) -> Result<Option<ArchiveInfo>> {
        let path = self.path_for(metric);
        if !path.is_file() {
            return Ok(None);
        }
        let archive = FlatFile::open(&path)?;
        Ok(Some(ArchiveInfo {
            aggregation_method: archive.aggregation_method(),
            max_retention: archive.max_retention(),
            x_files_factor: archive.x_files_factor(),
            archives: archive.archives().to_vec(),
        }))
    }

    async fn set_aggregation_method(&self, metric: &str, method: AggregationMethod) -> Result<()> {
        let path = self.path_for(metric);
        let mut archive = FlatFile::open(&path)?;
        archive.set_aggregation_method(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> WriterConfig {
        let mut config = WriterConfig::default();
        config.local_data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn metric_name_maps_to_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = metric_to_path(dir.path(), "servers.web01.cpu.load");
        assert_eq!(path, dir.path().join("servers/web01/cpu/load.wsp"));
    }

    #[tokio::test]
    async fn create_then_exists_then_update() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WhisperFileBackend::new(&test_config(dir.path()));
        let archives = vec![Retention { seconds_per_point: 60, points: 10 }];

        assert!(!backend.exists("a.b.c").await.unwrap());
        backend.create("a.b.c", &archives, 0.5, AggregationMethod::Average).await.unwrap();
        assert!(backend.exists("a.b.c").await.unwrap());

        backend.update_many("a.b.c", &[Datapoint::new(1000, 42.0)]).await.unwrap();

        let info = backend.info("a.b.c").await.unwrap().unwrap();
        assert_eq!(info.max_retention, 600);
    }

    #[tokio::test]
    async fn concurrent_create_race_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WhisperFileBackend::new(&test_config(dir.path()));
        let archives = vec![Retention { seconds_per_point: 60, points: 10 }];

        backend.create("a.b.c", &archives, 0.5, AggregationMethod::Average).await.unwrap();
        assert!(backend.create("a.b.c", &archives, 0.5, AggregationMethod::Average).await.is_ok());
    }
}
