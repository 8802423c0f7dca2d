//! Periodic schema-file reload timers.
//!
//! `writer.py::WriterService` runs two independent `LoopingCall`s, each
//! started with `.start(60, False)` — the `False` means "don't fire
//! immediately", so the first reload happens 60s after startup, not at
//! t=0. Ported onto two independent `tokio::time::interval` loops (one per
//! schema file, matching `reloadStorageSchemas`/`reloadAggregationSchemas`
//! being separate `LoopingCall`s that can drift independently) running on
//! the cooperative runtime rather than the writer's dedicated thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::schema::SchemaRegistry;

const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_storage_reload(registry: Arc<SchemaRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(RELOAD_INTERVAL).await;
        let mut interval = tokio::time::interval(RELOAD_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = registry.reload_storage() {
                error!(error = %e, "failed to reload storage schemas, keeping previous generation");
            } else {
                info!("storage schemas reloaded");
            }
        }
    })
}

pub fn spawn_aggregation_reload(registry: Arc<SchemaRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(RELOAD_INTERVAL).await;
        let mut interval = tokio::time::interval(RELOAD_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = registry.reload_aggregation() {
                error!(error = %e, "failed to reload aggregation schemas, keeping previous generation");
            } else {
                info!("aggregation schemas reloaded");
            }
        }
    })
}
