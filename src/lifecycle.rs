//! Start/stop orchestration for the writer thread and reload timers.
//!
//! Ported from carbon's `writer.py::WriterService` (a Twisted `Service`):
//! `startService` starts both `LoopingCall` reload timers, registers a
//! pre-shutdown hook, and runs the writer loop via `reactor.callInThread`;
//! `stopService` stops the timers. This crate has no Twisted reactor, so the
//! cooperative half (reload timers) runs as `tokio::task`s and the blocking
//! half (the writer) runs on a dedicated `std::thread`, joined on `stop()`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::task::JoinHandle as TaskHandle;
use tracing::info;

use crate::backend::StorageBackend;
use crate::cache::MetricCache;
use crate::config::WriterConfig;
use crate::events::CacheEvents;
use crate::reload;
use crate::schema::SchemaRegistry;
use crate::writer::Writer;

/// Owns everything `start()` spins up so `stop()` can tear it back down:
/// the two reload timers, the writer's dedicated thread, and the flags/
/// handles needed to signal and join them. Mirrors `WriterService`'s two
/// `LoopingCall` fields plus the implicit `reactor.callInThread` task.
pub struct LifecycleService {
    storage_reload: Option<TaskHandle<()>>,
    aggregation_reload: Option<TaskHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    running: Arc<std::sync::atomic::AtomicBool>,
    max_updates_per_second: Arc<std::sync::atomic::AtomicU32>,
    shutdown_override: Option<u32>,
}

impl LifecycleService {
    /// Builds the service and immediately starts it: both reload timers on
    /// the current Tokio runtime, and the Writer on its own thread. Must be
    /// called from within a Tokio runtime context (for `tokio::spawn` and to
    /// hand the Writer a `Handle` it can `block_on` with from its thread).
    pub fn start(
        config: WriterConfig,
        cache: Arc<MetricCache>,
        backend: Arc<dyn StorageBackend>,
        schemas: Arc<SchemaRegistry>,
        events: CacheEvents,
    ) -> Self {
        let shutdown_override = config.max_updates_per_second_on_shutdown;

        let storage_reload = reload::spawn_storage_reload(schemas.clone());
        let aggregation_reload = reload::spawn_aggregation_reload(schemas.clone());

        let runtime_handle = tokio::runtime::Handle::current();
        let writer = Writer::new(config, cache, backend, schemas, events, runtime_handle);
        let running = writer.running_flag();
        let max_updates_per_second = writer.max_updates_per_second_handle();

        info!("starting writer thread and schema reload timers");
        let writer_thread = std::thread::Builder::new()
            .name("archive-writer".to_string())
            .spawn(move || writer.run())
            .expect("failed to spawn dedicated writer thread");

        Self {
            storage_reload: Some(storage_reload),
            aggregation_reload: Some(aggregation_reload),
            writer_thread: Some(writer_thread),
            running,
            max_updates_per_second,
            shutdown_override,
        }
    }

    /// `reactor.addSystemEventTrigger('before', 'shutdown', shutdownModifyUpdateSpeed)`:
    /// swaps in `MAX_UPDATES_PER_SECOND_ON_SHUTDOWN` if one is configured, so
    /// the final drain runs at a different (usually higher) throttle.
    pub fn run_shutdown_hook(&self) {
        match self.shutdown_override {
            Some(rate) => {
                self.max_updates_per_second.store(rate, Ordering::Relaxed);
                info!(rate, "shutting down, changed update rate for final drain");
            }
            None => info!("shutting down, update rate not changed"),
        }
    }

    /// Stops both reload timers, signals the writer to exit its outer loop,
    /// runs the shutdown hook, and joins the writer thread. The writer
    /// finishes whatever pass it is mid-way through before observing the
    /// flag; mid-pass cancellation is not supported.
    pub fn stop(mut self) {
        if let Some(handle) = self.storage_reload.take() {
            handle.abort();
        }
        if let Some(handle) = self.aggregation_reload.take() {
            handle.abort();
        }

        self.run_shutdown_hook();
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
        info!("writer lifecycle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::whisper_file::WhisperFileBackend;
    use crate::cache::Datapoint;

    fn schema_registry() -> Arc<SchemaRegistry> {
        use std::io::Write;
        let mut storage = tempfile::NamedTempFile::new().unwrap();
        writeln!(storage, "[default]\npattern = .*\nretentions = 60:10").unwrap();
        let mut aggregation = tempfile::NamedTempFile::new().unwrap();
        writeln!(aggregation, "[default]\npattern = .*\nxFilesFactor = 0.5\naggregationMethod = average").unwrap();
        Arc::new(SchemaRegistry::load(storage.path().to_path_buf(), aggregation.path().to_path_buf()).unwrap())
    }

    #[tokio::test]
    async fn start_then_stop_drains_and_joins_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WriterConfig::default();
        config.local_data_dir = dir.path().to_path_buf();

        let cache = MetricCache::new();
        cache.store("a.b.c", Datapoint::new(1, 1.0));

        let backend: Arc<dyn StorageBackend> = Arc::new(WhisperFileBackend::new(&config));
        let schemas = schema_registry();
        let events = CacheEvents::new();

        let service = LifecycleService::start(config, cache.clone(), backend, schemas, events);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        service.stop();

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn shutdown_hook_applies_configured_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WriterConfig::default();
        config.local_data_dir = dir.path().to_path_buf();
        config.max_updates_per_second_on_shutdown = Some(5);

        let cache = MetricCache::new();
        let backend: Arc<dyn StorageBackend> = Arc::new(WhisperFileBackend::new(&config));
        let schemas = schema_registry();
        let events = CacheEvents::new();

        let service = LifecycleService::start(config, cache, backend, schemas, events);
        service.run_shutdown_hook();
        assert_eq!(service.max_updates_per_second.load(Ordering::Relaxed), 5);
        service.stop();
    }
}
