//! The admin `getMetadata`/`setMetadata` surface.
//!
//! Ported from carbon's `management.py`. The original catches any backend
//! exception and returns it as a traceback string rather than propagating;
//! `MetadataResult` is the typed equivalent — callers pattern-match instead
//! of catching. No transport (HTTP, gRPC) is wired up here: this module is
//! the library surface an embedding binary would expose over whichever
//! transport it chooses, matching how `carbon.management` itself is
//! transport-agnostic and called directly by the Twisted XML-RPC handler.

use std::sync::Arc;

use tracing::error;

use crate::backend::StorageBackend;
use crate::schema::AggregationMethod;

const SUPPORTED_KEY: &str = "aggregationMethod";

/// Outcome of a management RPC. Never an `Err` — unsupported keys and
/// backend failures are both returned as error records, not raised.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataResult {
    Value(AggregationMethod),
    OldAndNew { old: AggregationMethod, new: AggregationMethod },
    Error(String),
}

/// `carbon.management.getMetadata`.
pub async fn get_metadata(backend: &Arc<dyn StorageBackend>, metric: &str, key: &str) -> MetadataResult {
    if key != SUPPORTED_KEY {
        return MetadataResult::Error(format!("Unsupported metadata key \"{key}\""));
    }

    match backend.info(metric).await {
        Ok(Some(info)) => MetadataResult::Value(info.aggregation_method),
        Ok(None) => MetadataResult::Error(format!("no archive exists for metric '{metric}'")),
        Err(e) => {
            error!(metric, error = %e, "getMetadata failed");
            MetadataResult::Error(e.to_string())
        }
    }
}

/// `carbon.management.setMetadata`.
pub async fn set_metadata(
    backend: &Arc<dyn StorageBackend>,
    metric: &str,
    key: &str,
    value: AggregationMethod,
) -> MetadataResult {
    if key != SUPPORTED_KEY {
        return MetadataResult::Error(format!("Unsupported metadata key \"{key}\""));
    }

    let old = match backend.info(metric).await {
        Ok(Some(info)) => info.aggregation_method,
        Ok(None) => return MetadataResult::Error(format!("no archive exists for metric '{metric}'")),
        Err(e) => {
            error!(metric, error = %e, "setMetadata failed reading prior value");
            return MetadataResult::Error(e.to_string());
        }
    };

    match backend.set_aggregation_method(metric, value).await {
        Ok(()) => MetadataResult::OldAndNew { old, new: value },
        Err(e) => {
            error!(metric, error = %e, "setMetadata failed");
            MetadataResult::Error(e.to_string())
        }
    }
}
