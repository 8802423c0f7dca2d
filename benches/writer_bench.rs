//! Microbenchmarks for the write-scheduling hot path: draining the cache
//! through a `FlushScheduler` pass and committing via the flat-file backend,
//! at a few cache sizes (`criterion` + `tokio::runtime::Runtime::block_on`
//! inside `iter_custom`).

use std::sync::Arc;

use archive_writer::backend::WhisperFileBackend;
use archive_writer::cache::Datapoint;
use archive_writer::config::WriterConfig;
use archive_writer::schema::SchemaRegistry;
use archive_writer::MetricCache;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

const BENCH_METRIC_COUNTS: [usize; 3] = [10, 100, 1_000];
const POINTS_PER_METRIC: usize = 5;

fn schema_registry(dir: &std::path::Path) -> Arc<SchemaRegistry> {
    let storage_path = dir.join("storage-schemas.conf");
    let aggregation_path = dir.join("storage-aggregation.conf");
    std::fs::write(&storage_path, "[default]\npattern = .*\nretentions = 60:1440\n").unwrap();
    std::fs::write(
        &aggregation_path,
        "[default]\npattern = .*\nxFilesFactor = 0.5\naggregationMethod = average\n",
    )
    .unwrap();
    Arc::new(SchemaRegistry::load(storage_path, aggregation_path).unwrap())
}

fn fill_cache(metric_count: usize) -> Arc<MetricCache> {
    let cache = MetricCache::new();
    for i in 0..metric_count {
        for p in 0..POINTS_PER_METRIC {
            cache.store(&format!("bench.metric.{i}"), Datapoint::new(p as i64, p as f64));
        }
    }
    cache
}

fn bench_drain_pass(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("writer_drain_pass");
    group.sample_size(10);

    for &metric_count in &BENCH_METRIC_COUNTS {
        group.bench_with_input(BenchmarkId::new("non_batched", metric_count), &metric_count, |b, &count| {
            let dir = tempfile::tempdir().unwrap();
            let mut config = WriterConfig::default();
            config.local_data_dir = dir.path().to_path_buf();
            let backend: Arc<dyn archive_writer::backend::StorageBackend> =
                Arc::new(WhisperFileBackend::new(&config));
            let schemas = schema_registry(dir.path());

            b.iter_custom(|iters| {
                let start = std::time::Instant::now();
                for _ in 0..iters {
                    let cache = fill_cache(count);
                    let events = archive_writer::CacheEvents::new();
                    let mut writer = archive_writer::writer::Writer::new(
                        config.clone(),
                        cache.clone(),
                        backend.clone(),
                        schemas.clone(),
                        events,
                        rt.handle().clone(),
                    );
                    black_box(writer.run_single_pass().unwrap());
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_drain_pass);
criterion_main!(benches);
