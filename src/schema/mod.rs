//! Storage and aggregation schema matching.
//!
//! Ported from carbon's `storage-schemas.conf` / `storage-aggregation.conf`
//! INI format (see `loadStorageSchemas`/`loadAggregationSchemas` in the
//! original `carbon.storage` module): ordered sections, each with a `pattern`
//! regex and either a `retentions` list or an `xFilesFactor`/`aggregationMethod`
//! pair. First matching section wins; a section named `default` is
//! conventionally last and matches everything.
//!
//! Reload is atomic: both registries are replaced together behind one
//! `RwLock<Arc<_>>` swap so a reader never sees a storage schema from one
//! generation paired with an aggregation schema from another.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::error::{Result, WriterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Retention {
    /// Parses a `"60:1440"` (secondsPerPoint:points) or `"1m:1d"`
    /// (interval:duration) retention definition, as carbon's
    /// `storage.py::parseRetentionDef` accepts both forms.
    pub fn parse(def: &str) -> Result<Self> {
        let (left, right) = def.split_once(':').ok_or_else(|| {
            WriterError::SchemaParse {
                path: PathBuf::new(),
                reason: format!("malformed retention definition '{def}'"),
            }
        })?;

        let seconds_per_point = parse_duration_unit(left, def)?;
        let duration = parse_duration_unit(right, def)?;
        if seconds_per_point == 0 {
            return Err(WriterError::SchemaParse {
                path: PathBuf::new(),
                reason: format!("retention '{def}' has a zero-second precision"),
            });
        }
        let points = duration / seconds_per_point;
        Ok(Self { seconds_per_point, points })
    }
}

fn parse_duration_unit(raw: &str, def: &str) -> Result<u32> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let (num_part, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u32 = num_part.parse().map_err(|_| WriterError::SchemaParse {
        path: PathBuf::new(),
        reason: format!("invalid retention component in '{def}'"),
    })?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        "y" => 31536000,
        _ => {
            return Err(WriterError::SchemaParse {
                path: PathBuf::new(),
                reason: format!("unknown duration unit in '{def}'"),
            })
        }
    };
    Ok(n * multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl AggregationMethod {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "average" => Ok(Self::Average),
            "sum" => Ok(Self::Sum),
            "last" => Ok(Self::Last),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(WriterError::SchemaParse {
                path: PathBuf::new(),
                reason: format!("unknown aggregation method '{other}'"),
            }),
        }
    }
}

pub struct StorageSchema {
    pub name: String,
    pub pattern: Regex,
    pub archives: Vec<Retention>,
}

impl StorageSchema {
    pub fn matches(&self, metric: &str) -> bool {
        self.pattern.is_match(metric)
    }
}

pub struct AggregationSchema {
    pub name: String,
    pub pattern: Regex,
    pub x_files_factor: f32,
    pub aggregation_method: AggregationMethod,
}

impl AggregationSchema {
    pub fn matches(&self, metric: &str) -> bool {
        self.pattern.is_match(metric)
    }
}

/// A single atomic generation of both registries.
struct Registries {
    storage: Vec<StorageSchema>,
    aggregation: Vec<AggregationSchema>,
}

/// The result of matching a metric against both schema lists.
pub struct SchemaMatch {
    pub archives: Vec<Retention>,
    pub x_files_factor: Option<f32>,
    pub aggregation_method: Option<AggregationMethod>,
}

pub struct SchemaRegistry {
    inner: RwLock<Arc<Registries>>,
    storage_path: PathBuf,
    aggregation_path: PathBuf,
}

impl SchemaRegistry {
    /// Loads both schema files. A missing catch-all `.*` storage section is
    /// not rejected here: whether that turns out to matter is a per-metric
    /// question, resolved lazily by `lookup` at write time
    /// (`WriterError::NoStorageSchema`), not a load-time one.
    pub fn load(storage_path: PathBuf, aggregation_path: PathBuf) -> Result<Self> {
        let storage = parse_storage_schemas(&storage_path)?;
        let aggregation = parse_aggregation_schemas(&aggregation_path)?;
        warn_if_no_default(&storage, &storage_path);

        Ok(Self {
            inner: RwLock::new(Arc::new(Registries { storage, aggregation })),
            storage_path,
            aggregation_path,
        })
    }

    /// Re-parses both files and swaps them in atomically. A parse failure
    /// logs and keeps the previous generation (startup failure is fatal,
    /// reload failure is not).
    pub fn reload_storage(&self) -> Result<()> {
        let storage = parse_storage_schemas(&self.storage_path)?;
        warn_if_no_default(&storage, &self.storage_path);
        let mut guard = self.inner.write();
        let next = Registries {
            storage,
            aggregation: guard.aggregation.iter().map(clone_aggregation).collect(),
        };
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn reload_aggregation(&self) -> Result<()> {
        let aggregation = parse_aggregation_schemas(&self.aggregation_path)?;
        let mut guard = self.inner.write();
        let next = Registries {
            storage: guard.storage.iter().map(clone_storage).collect(),
            aggregation,
        };
        *guard = Arc::new(next);
        Ok(())
    }

    /// First-match-wins lookup across both registries, as
    /// `writer.py::writeCachedDataPoints` performs with two separate loops.
    pub fn lookup(&self, metric: &str) -> Option<SchemaMatch> {
        let snapshot = self.inner.read().clone();

        let archives = snapshot
            .storage
            .iter()
            .find(|s| s.matches(metric))
            .map(|s| s.archives.clone())?;

        let (x_files_factor, aggregation_method) = snapshot
            .aggregation
            .iter()
            .find(|s| s.matches(metric))
            .map(|s| (Some(s.x_files_factor), Some(s.aggregation_method)))
            .unwrap_or((None, None));

        Some(SchemaMatch { archives, x_files_factor, aggregation_method })
    }
}

fn clone_storage(s: &StorageSchema) -> StorageSchema {
    StorageSchema { name: s.name.clone(), pattern: s.pattern.clone(), archives: s.archives.clone() }
}

fn clone_aggregation(s: &AggregationSchema) -> AggregationSchema {
    AggregationSchema {
        name: s.name.clone(),
        pattern: s.pattern.clone(),
        x_files_factor: s.x_files_factor,
        aggregation_method: s.aggregation_method,
    }
}

/// Logs, but does not fail on, the absence of a catch-all `.*` storage
/// section. A metric that falls through every section is only an error at
/// the point it's actually written — `WriterError::NoStorageSchema` — so
/// this is advisory, not a load-time gate.
fn warn_if_no_default(schemas: &[StorageSchema], path: &Path) {
    if !schemas.iter().any(|s| s.pattern.as_str() == ".*") {
        warn!(path = %path.display(), "no catch-all ('.*') storage schema present; unmatched metrics will fail to write");
    }
}

/// INI sections of the form:
/// ```ini
/// [default]
/// pattern = .*
/// retentions = 60:1440,900:2016
/// ```
fn parse_storage_schemas(path: &Path) -> Result<Vec<StorageSchema>> {
    let sections = parse_ini(path)?;
    let mut schemas = Vec::with_capacity(sections.len());
    for (name, fields) in sections {
        let pattern_str = fields.get("pattern").cloned().unwrap_or_else(|| ".*".to_string());
        let pattern = Regex::new(&pattern_str).map_err(|e| WriterError::SchemaParse {
            path: path.to_path_buf(),
            reason: format!("invalid pattern in [{name}]: {e}"),
        })?;
        let retentions = fields.get("retentions").ok_or_else(|| WriterError::SchemaParse {
            path: path.to_path_buf(),
            reason: format!("[{name}] is missing 'retentions'"),
        })?;
        let archives = retentions
            .split(',')
            .map(|def| Retention::parse(def.trim()))
            .collect::<Result<Vec<_>>>()?;
        schemas.push(StorageSchema { name, pattern, archives });
    }
    Ok(schemas)
}

/// INI sections of the form:
/// ```ini
/// [default_average]
/// pattern = .*
/// xFilesFactor = 0.5
/// aggregationMethod = average
/// ```
fn parse_aggregation_schemas(path: &Path) -> Result<Vec<AggregationSchema>> {
    let sections = parse_ini(path)?;
    let mut schemas = Vec::with_capacity(sections.len());
    for (name, fields) in sections {
        let pattern_str = fields.get("pattern").cloned().unwrap_or_else(|| ".*".to_string());
        let pattern = Regex::new(&pattern_str).map_err(|e| WriterError::SchemaParse {
            path: path.to_path_buf(),
            reason: format!("invalid pattern in [{name}]: {e}"),
        })?;
        let x_files_factor: f32 = fields
            .get("xfilesfactor")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| WriterError::SchemaParse {
                path: path.to_path_buf(),
                reason: format!("invalid xFilesFactor in [{name}]"),
            })?
            .unwrap_or(0.5);
        let aggregation_method = fields
            .get("aggregationmethod")
            .map(|v| AggregationMethod::parse(v))
            .transpose()?
            .unwrap_or(AggregationMethod::Average);
        schemas.push(AggregationSchema { name, pattern, x_files_factor, aggregation_method });
    }
    Ok(schemas)
}

/// A tiny INI parser: `[section]` headers, `key = value` lines, `#`/`;`
/// comments. Keys are lowercased for case-insensitive lookup.
fn parse_ini(path: &Path) -> Result<Vec<(String, HashMap<String, String>)>> {
    let content = std::fs::read_to_string(path).map_err(|e| WriterError::io(path.to_path_buf(), e))?;

    let mut sections = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_fields: HashMap<String, String> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            if let Some(prev) = current_name.take() {
                sections.push((prev, std::mem::take(&mut current_fields)));
            }
            current_name = Some(name.to_string());
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            current_fields.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    if let Some(prev) = current_name.take() {
        sections.push((prev, current_fields));
    }
    Ok(sections)
}
