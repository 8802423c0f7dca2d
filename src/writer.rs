//! The write-scheduling worker loop.
//!
//! Ported from writer.py's `writeCachedDataPoints`/`writeForever`. Runs on
//! its own dedicated OS thread rather than as a tokio task,
//! since every operation it performs — draining the cache, creating and
//! updating archive files, sleeping for rate limiting — is blocking by
//! nature; a `tokio::runtime::Handle` is carried only so the handful of
//! `async fn` calls on `StorageBackend` can be driven with `block_on`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::backend::{BatchUpdate, StorageBackend};
use crate::cache::{Datapoint, MetricCache};
use crate::config::WriterConfig;
use crate::error::{Result, WriterError};
use crate::events::CacheEvents;
use crate::schema::SchemaRegistry;
use crate::scheduler::{CreateBudget, FlushCandidate, FlushScheduler, PopResult};
use crate::telemetry::instrumentation;

/// Mutable state the writer carries across passes (`createBudget` wraps
/// `lastCreateInterval`/`createCount`; the rest are plain fields here).
pub struct WriterState {
    create_budget: CreateBudget,
    last_second: i64,
    updates: u32,
    seen_metrics: HashSet<String>,
}

impl WriterState {
    pub fn new() -> Self {
        Self { create_budget: CreateBudget::new(), last_second: 0, updates: 0, seen_metrics: HashSet::new() }
    }
}

impl Default for WriterState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Writer {
    config: WriterConfig,
    cache: Arc<MetricCache>,
    backend: Arc<dyn StorageBackend>,
    schemas: Arc<SchemaRegistry>,
    events: CacheEvents,
    runtime: Handle,
    state: WriterState,
    running: Arc<AtomicBool>,
    /// Overridden by the lifecycle shutdown hook to
    /// `MAX_UPDATES_PER_SECOND_ON_SHUTDOWN`, mirroring
    /// writer.py::shutdownModifyUpdateSpeed.
    max_updates_per_second: Arc<AtomicU32>,
}

impl Writer {
    pub fn new(
        config: WriterConfig,
        cache: Arc<MetricCache>,
        backend: Arc<dyn StorageBackend>,
        schemas: Arc<SchemaRegistry>,
        events: CacheEvents,
        runtime: Handle,
    ) -> Self {
        let max_updates_per_second = Arc::new(AtomicU32::new(config.max_updates_per_second));
        Self {
            config,
            cache,
            backend,
            schemas,
            events,
            runtime,
            state: WriterState::new(),
            running: Arc::new(AtomicBool::new(false)),
            max_updates_per_second,
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn max_updates_per_second_handle(&self) -> Arc<AtomicU32> {
        self.max_updates_per_second.clone()
    }

    /// The dedicated-thread main loop. Returns when `running` is flipped to
    /// `false` by the lifecycle service.
    pub fn run(mut self) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.write_cached_data_points() {
                debug_assert!(e.is_fatal_to_pass(), "only a fatal-to-pass error should ever escape a drain pass");
                error!(error = %e, "writeCachedDataPoints aborted");
                instrumentation::record_error();
            }
            // writer.py::writeForever sleeps unconditionally after each pass,
            // whether it drained cleanly or aborted on error.
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Public wrapper around a single `write_cached_data_points` drain pass,
    /// exposed for benchmarking the scheduling/commit hot path in isolation
    /// from the `run()` outer loop's sleep-and-retry behavior.
    pub fn run_single_pass(&mut self) -> Result<()> {
        self.write_cached_data_points()
    }

    /// Drains the cache completely, running fresh `FlushScheduler` passes
    /// until it reports empty. Returns `Err` only for the fatal
    /// (no-schema-match, or a failed existence check) cases, matching
    /// writer.py's uncaught-exception-aborts-the-whole-call behavior.
    ///
    /// Each candidate the scheduler yields is handed to `handle_candidate`
    /// immediately, not collected up front: `FlushScheduler::next()` pops a
    /// metric's datapoints out of the cache as part of producing its
    /// result, so once a candidate is fatal the scheduler must stop being
    /// driven right there — any metric not yet popped stays in the cache
    /// for the next pass, exactly as writer.py's lazy `optimalWriteOrder`
    /// generator leaves it when the loop driving it raises.
    fn write_cached_data_points(&mut self) -> Result<()> {
        while !self.cache.is_empty() {
            let mut data_written = false;
            let mut batch: HashMap<String, Vec<Datapoint>> = HashMap::new();
            let mut pass_error: Option<WriterError> = None;

            {
                // `FlushScheduler` borrows `self.events` and
                // `self.state.create_budget` for its lifetime. Every other
                // field `handle_candidate`/`apply_rate_limit` touch below
                // (`self.state.seen_metrics`, `self.state.last_second`,
                // `self.state.updates`, `self.schemas`, `self.backend`,
                // `self.runtime`, `self.config`) is a disjoint field, so
                // passing them in by explicit reference — rather than
                // calling methods that take `&mut self` as a whole — lets
                // the scheduler stay borrowed while we interleave `next()`
                // with handling each candidate.
                let mut scheduler = FlushScheduler::new(
                    self.cache.clone(),
                    self.backend.clone(),
                    &self.events,
                    self.runtime.clone(),
                    &mut self.state.create_budget,
                    self.config.max_creates_per_minute,
                    self.config.cache_low_watermark(),
                    self.config.enable_batched_writes,
                );

                while let Some(result) = scheduler.next() {
                    match result {
                        PopResult::Flush(candidate) => {
                            data_written = true;
                            let outcome = handle_candidate(
                                candidate,
                                &mut batch,
                                &mut self.state.seen_metrics,
                                &self.schemas,
                                &self.backend,
                                &self.runtime,
                                &self.config,
                                &mut self.state.last_second,
                                &mut self.state.updates,
                                &self.max_updates_per_second,
                            );
                            if let Err(e) = outcome {
                                pass_error = Some(e);
                                break;
                            }
                        }
                        PopResult::Dropped { metric } => {
                            data_written = true;
                            debug!(metric = %metric, "create budget exhausted, dropping datapoints");
                        }
                        PopResult::Contention { metric } => {
                            data_written = true;
                            debug!(metric = %metric, "cache contention, skipping for now");
                        }
                        PopResult::Fatal(e) => {
                            pass_error = Some(e);
                            break;
                        }
                    }
                }
                // `scheduler` is dropped here without being driven further,
                // so no metric after the failing (or never-reached)
                // candidate is popped from the cache this pass.
            }

            // Whatever accumulated in `batch` before a fatal candidate was
            // already popped out of the cache, so it must still be flushed
            // here rather than discarded — those points can no longer be
            // "left in the cache for a later pass".
            if !batch.is_empty() {
                self.flush_batch(batch);
            }

            if let Some(e) = pass_error {
                return Err(e);
            }

            if !data_written {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        Ok(())
    }

    fn flush_batch(&mut self, batch: HashMap<String, Vec<Datapoint>>) {
        let batch_size = batch.len() as u32;
        let point_count: u64 = batch.values().map(|v| v.len() as u64).sum();
        let updates: Vec<BatchUpdate> =
            batch.into_iter().map(|(metric, points)| BatchUpdate { metric, points }).collect();

        let start = SystemTime::now();
        match self.runtime.block_on(self.backend.batch_update_many(&updates)) {
            Ok(()) => {
                let elapsed = start.elapsed().unwrap_or_default().as_secs_f64();
                instrumentation::record_committed_points(point_count);
                instrumentation::record_update_time(elapsed);
                instrumentation::record_batch_size(batch_size as u64);
                if self.config.log_batch_updates {
                    debug!(metrics = batch_size, points = point_count, seconds = elapsed, "wrote batch");
                }
                apply_rate_limit(&mut self.state.last_second, &mut self.state.updates, &self.max_updates_per_second, batch_size);
            }
            Err(e) => {
                warn!(batch_size, error = %e, "error batch writing metrics");
                // Open Question resolution: a batch failure counts as exactly
                // one error, never `batch_size` errors, regardless of how
                // many metrics were in the batch.
                instrumentation::record_error();
            }
        }
    }
}

/// Handles a single `FlushScheduler` candidate: new-metric create (if
/// needed), then either stages it into `batch` (batched mode) or commits it
/// immediately via `update_many`. Takes its dependencies as explicit
/// references rather than `&mut self` so the caller can keep a
/// `FlushScheduler` borrowing other fields of `Writer` alive across the
/// call — see the comment in `write_cached_data_points`.
#[allow(clippy::too_many_arguments)]
fn handle_candidate(
    candidate: FlushCandidate,
    batch: &mut HashMap<String, Vec<Datapoint>>,
    seen_metrics: &mut HashSet<String>,
    schemas: &SchemaRegistry,
    backend: &Arc<dyn StorageBackend>,
    runtime: &Handle,
    config: &WriterConfig,
    last_second: &mut i64,
    updates: &mut u32,
    max_updates_per_second: &AtomicU32,
) -> Result<()> {
    let FlushCandidate { metric, datapoints, db_file_exists } = candidate;

    if seen_metrics.insert(metric.clone()) {
        debug!(metric = %metric, "new metric seen");
    }

    if !db_file_exists {
        let matched =
            schemas.lookup(&metric).ok_or_else(|| WriterError::NoStorageSchema { metric: metric.clone() })?;

        let x_files_factor = matched.x_files_factor.unwrap_or(0.5);
        let aggregation_method =
            matched.aggregation_method.unwrap_or(crate::schema::AggregationMethod::Average);

        match runtime.block_on(backend.create(&metric, &matched.archives, x_files_factor, aggregation_method)) {
            Ok(()) => {
                instrumentation::record_create();
            }
            Err(e) => {
                warn!(metric = %metric, error = %e, "create failed, dropping already-popped datapoints for this pass");
                instrumentation::record_error();
                return Ok(());
            }
        }
    }

    if config.enable_batched_writes {
        batch.insert(metric, datapoints);
        return Ok(());
    }

    let start = SystemTime::now();
    match runtime.block_on(backend.update_many(&metric, &datapoints)) {
        Ok(()) => {
            let elapsed = start.elapsed().unwrap_or_default().as_secs_f64();
            let point_count = datapoints.len() as u64;
            instrumentation::record_committed_points(point_count);
            instrumentation::record_update_time(elapsed);
            if config.log_updates {
                debug!(metric = %metric, points = point_count, seconds = elapsed, "wrote datapoints");
            }
            apply_rate_limit(last_second, updates, max_updates_per_second, 1);
        }
        Err(e) => {
            warn!(metric = %metric, error = %e, "error writing metric");
            instrumentation::record_error();
        }
    }
    Ok(())
}

/// `writer.py`'s per-second rate limiter: reset on a new second boundary,
/// otherwise accumulate `op_count` and stall until the next boundary once
/// the budget is exceeded.
fn apply_rate_limit(last_second: &mut i64, updates: &mut u32, max_updates_per_second: &AtomicU32, op_count: u32) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    let this_second = now.floor() as i64;

    if this_second != *last_second {
        *last_second = this_second;
        *updates = 0;
    } else {
        *updates += op_count;
        let max = max_updates_per_second.load(Ordering::Relaxed);
        if *updates >= max {
            let target = now.floor() + 1.0;
            let sleep_secs = (target - now).max(0.0);
            std::thread::sleep(Duration::from_secs_f64(sleep_secs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArchiveInfo, StorageBackend};
    use crate::schema::{AggregationMethod, Retention};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        created: Mutex<HashSet<String>>,
        written: Mutex<HashMap<String, Vec<Datapoint>>>,
    }

    #[async_trait]
    impl StorageBackend for FakeBackend {
        async fn exists(&self, metric: &str) -> Result<bool> {
            Ok(self.created.lock().unwrap().contains(metric))
        }

        async fn create(
            &self,
            metric: &str,
            _archives: &[Retention],
            _x: f32,
            _m: AggregationMethod,
        ) -> Result<()> {
            self.created.lock().unwrap().insert(metric.to_string());
            Ok(())
        }

        async fn update_many(&self, metric: &str, points: &[Datapoint]) -> Result<()> {
            self.written.lock().unwrap().entry(metric.to_string()).or_default().extend_from_slice(points);
            Ok(())
        }

        async fn info(&self, _metric: &str) -> Result<Option<ArchiveInfo>> {
            Ok(None)
        }

        async fn set_aggregation_method(&self, _metric: &str, _method: AggregationMethod) -> Result<()> {
            Ok(())
        }
    }

    fn schema_registry() -> Arc<SchemaRegistry> {
        use std::io::Write;
        let mut storage = tempfile::NamedTempFile::new().unwrap();
        writeln!(storage, "[default]\npattern = .*\nretentions = 60:1440").unwrap();
        let mut aggregation = tempfile::NamedTempFile::new().unwrap();
        writeln!(aggregation, "[default]\npattern = .*\nxFilesFactor = 0.5\naggregationMethod = average").unwrap();
        Arc::new(SchemaRegistry::load(storage.path().to_path_buf(), aggregation.path().to_path_buf()).unwrap())
    }

    /// A schema registry with no catch-all storage schema: any metric name
    /// other than `"matched.*"` fails lookup and triggers `NoStorageSchema`.
    fn schema_registry_without_catch_all() -> Arc<SchemaRegistry> {
        use std::io::Write;
        let mut storage = tempfile::NamedTempFile::new().unwrap();
        writeln!(storage, "[only]\npattern = ^matched\\.\nretentions = 60:1440").unwrap();
        let mut aggregation = tempfile::NamedTempFile::new().unwrap();
        writeln!(aggregation, "[default]\npattern = .*\nxFilesFactor = 0.5\naggregationMethod = average").unwrap();
        Arc::new(SchemaRegistry::load(storage.path().to_path_buf(), aggregation.path().to_path_buf()).unwrap())
    }

    #[tokio::test]
    async fn drains_cache_and_creates_missing_metric() {
        let cache = MetricCache::new();
        cache.store("a.b.c", Datapoint::new(1, 1.0));

        let backend: Arc<dyn StorageBackend> = Arc::new(FakeBackend::default());
        let schemas = schema_registry();
        let events = CacheEvents::new();
        let runtime = Handle::current();
        let cache_for_assert = cache.clone();

        // Writer::write_cached_data_points blocks on its `Handle` to drive
        // async backend calls, which panics if invoked from a thread the
        // runtime is already driving — `spawn_blocking` hands it a thread
        // outside the runtime, exactly as the dedicated writer thread in
        // production.
        tokio::task::spawn_blocking(move || {
            let mut writer = Writer::new(WriterConfig::default(), cache, backend, schemas, events, runtime);
            writer.write_cached_data_points().unwrap();
        })
        .await
        .unwrap();

        assert!(cache_for_assert.is_empty());
    }

    /// A backend error on `update_many` is absorbed (logged, `errors`
    /// incremented) and the pass continues; the already-popped datapoints
    /// for that metric are discarded rather than retried. Uses `mockall`'s
    /// generated `MockStorageBackend` rather than a hand-rolled fake, to
    /// exercise the call-count expectations directly.
    #[tokio::test]
    async fn update_many_failure_is_absorbed_and_pass_continues() {
        use crate::backend::MockStorageBackend;

        let cache = MetricCache::new();
        cache.store("existing.metric", Datapoint::new(1, 1.0));

        let mut mock = MockStorageBackend::new();
        mock.expect_exists().returning(|_| Ok(true));
        mock.expect_update_many().times(1).returning(|_, _| {
            Err(WriterError::Backend("disk full".to_string()))
        });

        let backend: Arc<dyn StorageBackend> = Arc::new(mock);
        let schemas = schema_registry();
        let events = CacheEvents::new();
        let runtime = Handle::current();
        let cache_for_assert = cache.clone();

        tokio::task::spawn_blocking(move || {
            let mut writer = Writer::new(WriterConfig::default(), cache, backend, schemas, events, runtime);
            writer.write_cached_data_points().unwrap();
        })
        .await
        .unwrap();

        assert!(cache_for_assert.is_empty());
    }

    /// A `NoStorageSchema` failure on one candidate must stop the scheduler
    /// from popping any further metric out of the cache this pass: the
    /// larger-queued `first.unmatched` (processed first, non-batched mode
    /// sorts by queue size descending) fails lookup and aborts the pass,
    /// and `second.matched` — which would have been processed next — must
    /// still be sitting in the cache afterward rather than having been
    /// popped and silently dropped.
    #[tokio::test]
    async fn schema_lookup_failure_stops_the_pass_without_dropping_later_candidates() {
        let cache = MetricCache::new();
        cache.store("first.unmatched", Datapoint::new(1, 1.0));
        cache.store("first.unmatched", Datapoint::new(2, 2.0));
        cache.store("second.matched", Datapoint::new(3, 3.0));

        let backend: Arc<dyn StorageBackend> = Arc::new(FakeBackend::default());
        let schemas = schema_registry_without_catch_all();
        let events = CacheEvents::new();
        let runtime = Handle::current();
        let cache_for_assert = cache.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut writer = Writer::new(WriterConfig::default(), cache, backend, schemas, events, runtime);
            writer.write_cached_data_points()
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(WriterError::NoStorageSchema { .. })));

        // The un-popped metric is still in the cache, untouched, for a
        // later pass — not lost.
        let remaining = cache_for_assert.pop("second.matched").expect("second.matched must survive the pass");
        assert_eq!(remaining, vec![Datapoint::new(3, 3.0)]);
    }

    /// The same failure mode in batched mode: whatever had already
    /// accumulated into the batch map before the failing candidate must
    /// still be committed, since those datapoints are already popped from
    /// the cache and can no longer be "left for a later pass".
    #[tokio::test]
    async fn schema_lookup_failure_still_flushes_the_batch_accumulated_so_far() {
        use crate::backend::MockStorageBackend;

        let cache = MetricCache::new();
        // Larger queue so it sorts first in the (still-sorted) batched-mode
        // snapshot ordering and is staged into the batch before the failure.
        cache.store("existing.one", Datapoint::new(1, 1.0));
        cache.store("existing.one", Datapoint::new(2, 2.0));
        cache.store("new.unmatched", Datapoint::new(3, 3.0));

        let mut mock = MockStorageBackend::new();
        mock.expect_exists().withf(|m| m == "existing.one").returning(|_| Ok(true));
        mock.expect_exists().withf(|m| m == "new.unmatched").returning(|_| Ok(false));
        mock.expect_batch_update_many().times(1).returning(|updates| {
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].metric, "existing.one");
            Ok(())
        });

        let backend: Arc<dyn StorageBackend> = Arc::new(mock);
        let schemas = schema_registry_without_catch_all();
        let events = CacheEvents::new();
        let runtime = Handle::current();

        let mut config = WriterConfig::default();
        config.enable_batched_writes = true;

        let result = tokio::task::spawn_blocking(move || {
            let mut writer = Writer::new(config, cache, backend, schemas, events, runtime);
            writer.write_cached_data_points()
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(WriterError::NoStorageSchema { .. })));
    }
}
