//! Named backend constructor registry.
//!
//! Carbon's `DB_INIT_FUNC` setting holds a dotted Python import path,
//! dynamically imported at startup to build the storage engine. Rust has
//! no equivalent dynamic-import story, so this crate resolves
//! `DB_INIT_FUNC` against a process-wide table of named constructors
//! instead, registered once via `register_backend` using a
//! `once_cell::sync::OnceCell`/`Lazy` singleton.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::backend::{StorageBackend, WhisperFileBackend};
use crate::config::WriterConfig;
use crate::error::{Result, WriterError};

type Constructor = Arc<dyn Fn(&WriterConfig) -> Arc<dyn StorageBackend> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, Constructor>>> = Lazy::new(|| {
    let mut map: HashMap<String, Constructor> = HashMap::new();
    map.insert(
        "whisper_file".to_string(),
        Arc::new(|config: &WriterConfig| Arc::new(WhisperFileBackend::new(config)) as Arc<dyn StorageBackend>),
    );
    RwLock::new(map)
});

/// Registers (or replaces) a named backend constructor. Call this before
/// `create_backend` if `DB_INIT_FUNC` names something other than the
/// built-in `whisper_file`.
pub fn register_backend(
    name: impl Into<String>,
    constructor: impl Fn(&WriterConfig) -> Arc<dyn StorageBackend> + Send + Sync + 'static,
) {
    REGISTRY.write().insert(name.into(), Arc::new(constructor));
}

/// Resolves `config.db_init_func` against the registry and constructs the
/// backend: no dynamic loading, a fixed set of named, in-process
/// constructors.
pub fn create_backend(config: &WriterConfig) -> Result<Arc<dyn StorageBackend>> {
    let registry = REGISTRY.read();
    let constructor = registry
        .get(&config.db_init_func)
        .ok_or_else(|| WriterError::Config(format!("unknown DB_INIT_FUNC '{}'", config.db_init_func)))?;
    Ok(constructor(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_whisper_file_constructor_resolves() {
        let config = WriterConfig::default();
        assert!(create_backend(&config).is_ok());
    }

    #[test]
    fn unknown_constructor_name_is_a_config_error() {
        let mut config = WriterConfig::default();
        config.db_init_func = "nonexistent".to_string();
        assert!(create_backend(&config).is_err());
    }
}
