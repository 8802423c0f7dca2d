//! Write-scheduling and persistence subsystem for a time-series metric
//! ingestion pipeline.
//!
//! Metric samples accumulate in an in-memory [`cache::MetricCache`] and are
//! drained by a long-lived [`writer::Writer`] into a pluggable
//! [`backend::StorageBackend`], under two independent rate limiters (new
//! archive creation per minute, commit operations per second). This crate
//! owns the scheduling policy, not the network receiver, the archive file
//! format, or the schema file parser's consumers — those are the rest of
//! the ingestion pipeline this crate is one subsystem of.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod management;
pub mod reload;
pub mod schema;
pub mod scheduler;
pub mod telemetry;
pub mod writer;

pub use cache::{Datapoint, MetricCache};
pub use config::WriterConfig;
pub use error::{Result, WriterError};
pub use events::{CacheEvent, CacheEvents};
pub use lifecycle::LifecycleService;
pub use schema::SchemaRegistry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
