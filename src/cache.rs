//! The in-memory staging area datapoints sit in between ingestion and the
//! flush scheduler pulling them out for a write.
//!
//! This is a narrowly-scoped, single-purpose cache: it exists to satisfy
//! `Writer`'s need for "counts per metric" and "pop all points for a metric",
//! not as a general-purpose cache library. Metric points accumulate here
//! until `FlushScheduler` decides the metric is due, at which point `pop`
//! drains them atomically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A single `(timestamp, value)` sample for a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: f64,
}

impl Datapoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Default)]
struct Inner {
    points: HashMap<String, Vec<Datapoint>>,
    size: usize,
}

/// Thread-safe store of pending datapoints keyed by metric name.
///
/// Guarded by `parking_lot::RwLock` rather than an async lock: every access
/// is a short, non-blocking map operation, and the dedicated writer thread
/// must not await a tokio lock from outside the runtime.
pub struct MetricCache {
    inner: RwLock<Inner>,
    too_full: AtomicBool,
}

impl MetricCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            too_full: AtomicBool::new(false),
        })
    }

    /// Appends a point for `metric`, returning the new total cache size.
    pub fn store(&self, metric: &str, point: Datapoint) -> usize {
        let mut inner = self.inner.write();
        inner.points.entry(metric.to_string()).or_default().push(point);
        inner.size += 1;
        inner.size
    }

    /// Snapshot of `(metric, queue_len)` pairs, used by `FlushScheduler` to
    /// compute optimal write order.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.inner
            .read()
            .points
            .iter()
            .map(|(name, points)| (name.clone(), points.len()))
            .collect()
    }

    /// Removes and returns every pending point for `metric`, or `None` if
    /// the metric has no queue (already drained by a concurrent pass).
    pub fn pop(&self, metric: &str) -> Option<Vec<Datapoint>> {
        let mut inner = self.inner.write();
        let points = inner.points.remove(metric)?;
        inner.size = inner.size.saturating_sub(points.len());
        Some(points)
    }

    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn set_too_full(&self, value: bool) {
        self.too_full.store(value, Ordering::SeqCst);
    }

    pub fn is_too_full(&self) -> bool {
        self.too_full.load(Ordering::SeqCst)
    }
}
