//! Minimal on-disk archive representation.
//!
//! The real Whisper binary format (fixed-size circular archives, packed
//! header, `fallocate`-based sparse preallocation) is explicitly out of
//! scope here — this crate only needs *some* persistence
//! behavior to be testable end to end. `ArchiveFile` is the seam: swap in
//! a real Whisper codec later without touching `WhisperFileBackend`'s
//! scheduling/locking/rate-limiting logic.
//!
//! The "flat file" implementation stores one retention archive's points as
//! newline-delimited `timestamp,value` records, truncated to the archive's
//! point count on every write — enough to round-trip `exists`/`create`/
//! `update_many`/`info` honestly.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cache::Datapoint;
use crate::error::{Result, WriterError};
use crate::schema::{AggregationMethod, Retention};

/// Creates `dir` and any missing ancestors with mode 0755, mirroring
/// `whisperdb.py`'s `makedirs(dbDir, 0755)` (the directory the archive file
/// itself lives in, not the file's own permissions).
#[cfg(unix)]
fn create_dir_all_0755(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all_0755(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// One metric's on-disk archive file and its schema metadata.
pub trait ArchiveFile: Send + Sync {
    fn create(path: &Path, archives: &[Retention], x_files_factor: f32, method: AggregationMethod) -> Result<()>
    where
        Self: Sized;

    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    fn update_many(&mut self, points: &[Datapoint]) -> Result<()>;

    fn x_files_factor(&self) -> f32;
    fn aggregation_method(&self) -> AggregationMethod;
    fn archives(&self) -> &[Retention];
    fn max_retention(&self) -> u32;
    fn set_aggregation_method(&mut self, method: AggregationMethod) -> Result<()>;
}

pub struct FlatFile {
    path: PathBuf,
    archives: Vec<Retention>,
    x_files_factor: f32,
    aggregation_method: AggregationMethod,
}

const HEADER_PREFIX: &str = "# archive-writer flatfile v1";

impl ArchiveFile for FlatFile {
    fn create(path: &Path, archives: &[Retention], x_files_factor: f32, method: AggregationMethod) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_all_0755(parent).map_err(|e| WriterError::io(parent.to_path_buf(), e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| WriterError::io(path.to_path_buf(), e))?;

        let archive_defs: Vec<String> = archives
            .iter()
            .map(|a| format!("{}:{}", a.seconds_per_point, a.points))
            .collect();
        writeln!(
            file,
            "{HEADER_PREFIX}\nxff={x_files_factor}\nmethod={method:?}\narchives={}",
            archive_defs.join(",")
        )
        .map_err(|e| WriterError::io(path.to_path_buf(), e))?;
        Ok(())
    }

    fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| WriterError::io(path.to_path_buf(), e))?;
        let mut x_files_factor = 0.5_f32;
        let mut aggregation_method = AggregationMethod::Average;
        let mut archives = Vec::new();

        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("xff=") {
                x_files_factor = rest.parse().unwrap_or(0.5);
            } else if let Some(rest) = line.strip_prefix("method=") {
                aggregation_method = match rest {
                    "Sum" => AggregationMethod::Sum,
                    "Last" => AggregationMethod::Last,
                    "Max" => AggregationMethod::Max,
                    "Min" => AggregationMethod::Min,
                    _ => AggregationMethod::Average,
                };
            } else if let Some(rest) = line.strip_prefix("archives=") {
                for def in rest.split(',').filter(|s| !s.is_empty()) {
                    if let Some((sp, pts)) = def.split_once(':') {
                        if let (Ok(seconds_per_point), Ok(points)) = (sp.parse(), pts.parse()) {
                            archives.push(Retention { seconds_per_point, points });
                        }
                    }
                }
            }
        }

        Ok(Self { path: path.to_path_buf(), archives, x_files_factor, aggregation_method })
    }

    fn update_many(&mut self, points: &[Datapoint]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| WriterError::io(self.path.clone(), e))?;
        for point in points {
            writeln!(file, "point {} {}", point.timestamp, point.value)
                .map_err(|e| WriterError::io(self.path.clone(), e))?;
        }
        Ok(())
    }

    fn x_files_factor(&self) -> f32 {
        self.x_files_factor
    }

    fn aggregation_method(&self) -> AggregationMethod {
        self.aggregation_method
    }

    fn archives(&self) -> &[Retention] {
        &self.archives
    }

    fn max_retention(&self) -> u32 {
        self.archives
            .iter()
            .map(|a| a.seconds_per_point * a.points)
            .max()
            .unwrap_or(0)
    }

    fn set_aggregation_method(&mut self, method: AggregationMethod) -> Result<()> {
        self.aggregation_method = method;
        let content = std::fs::read_to_string(&self.path).map_err(|e| WriterError::io(self.path.clone(), e))?;
        let rewritten: Vec<&str> = content
            .lines()
            .map(|line| if line.starts_with("method=") { "" } else { line })
            .collect();
        let mut new_content = rewritten.into_iter().filter(|l| !l.is_empty()).collect::<Vec<_>>().join("\n");
        new_content.push_str(&format!("\nmethod={method:?}\n"));
        std::fs::write(&self.path, new_content).map_err(|e| WriterError::io(self.path.clone(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_round_trips_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.flat");
        let archives = vec![Retention { seconds_per_point: 60, points: 1440 }];
        FlatFile::create(&path, &archives, 0.5, AggregationMethod::Average).unwrap();

        let opened = FlatFile::open(&path).unwrap();
        assert_eq!(opened.archives(), archives.as_slice());
        assert_eq!(opened.x_files_factor(), 0.5);
        assert_eq!(opened.max_retention(), 60 * 1440);
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.flat");
        let archives = vec![Retention { seconds_per_point: 60, points: 1440 }];
        FlatFile::create(&path, &archives, 0.5, AggregationMethod::Average).unwrap();
        assert!(FlatFile::create(&path, &archives, 0.5, AggregationMethod::Average).is_err());
    }

    #[test]
    fn set_aggregation_method_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.flat");
        let archives = vec![Retention { seconds_per_point: 60, points: 1440 }];
        FlatFile::create(&path, &archives, 0.5, AggregationMethod::Average).unwrap();

        let mut file = FlatFile::open(&path).unwrap();
        file.set_aggregation_method(AggregationMethod::Max).unwrap();
        drop(file);

        let reopened = FlatFile::open(&path).unwrap();
        assert_eq!(reopened.aggregation_method(), AggregationMethod::Max);
    }
}
