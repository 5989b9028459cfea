//! Temporary configuration and state files read by worker processes at
//! startup
//!
//! Files are created with `tempfile` so that they are removed when the
//! owning [`TempArtifacts`] is dropped, normally together with the worker
//! handle.

use crate::job::{AnalysisLimits, Detector, PersistedState};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir, TempPath};

/// Section header of the limits file
pub const LIMITS_SECTION: &str = "[anomaly]";

/// Base name of the numbered state files; the worker appends the number
pub const STATE_FILE_BASE: &str = "model_state";

/// Extension of the numbered state files
pub const STATE_FILE_EXTENSION: &str = ".xml";

/// Temporary files and directories that must outlive worker startup
#[derive(Debug, Default)]
pub struct TempArtifacts {
    files: Vec<TempPath>,
    dirs: Vec<TempDir>,
}

impl TempArtifacts {
    pub(crate) fn push_file(&mut self, path: TempPath) -> PathBuf {
        let owned = path.to_path_buf();
        self.files.push(path);
        owned
    }

    pub(crate) fn push_dir(&mut self, dir: TempDir) {
        self.dirs.push(dir);
    }

    /// Paths of all files held
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|p| p.as_ref())
    }

    /// Paths of all directories held
    pub fn dirs(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(TempDir::path)
    }
}

/// Contents of the limits file
pub fn limits_contents(limits: &AnalysisLimits) -> String {
    let mut contents = format!("{}\n", LIMITS_SECTION);
    if let Some(values) = limits.max_field_values.filter(|v| *v > 0) {
        contents.push_str(&format!("maxfieldvalues = {}\n", values));
    }
    if let Some(buckets) = limits.max_time_buckets.filter(|v| *v > 0) {
        contents.push_str(&format!("maxtimebuckets = {}\n", buckets));
    }
    contents
}

/// Contents of the field config file. A detector whose key was already
/// written is skipped with a warning.
pub fn field_config_contents(detectors: &[Detector]) -> String {
    let mut contents = String::new();
    let mut keys = HashSet::new();

    for detector in detectors {
        let key = detector.key();
        if !keys.insert(key.clone()) {
            tracing::warn!("Duplicate detector key '{}', ignoring this detector", key);
            continue;
        }

        // isEnabled only when nothing else will mention the key
        if detector.use_null.is_none()
            && detector.by_field().is_none()
            && detector.over_field().is_none()
            && detector.partition_field().is_none()
        {
            contents.push_str(&format!("{}.isEnabled = true\n", key));
        }
        if let Some(use_null) = detector.use_null {
            contents.push_str(&format!("{}.useNull = {}\n", key, use_null));
        }
        if let Some(exclude) = detector.exclude_frequent_value() {
            contents.push_str(&format!("{}.excludefrequent = {}\n", key, exclude));
        }
        if let Some(by) = detector.by_field() {
            contents.push_str(&format!("{}.by = {}\n", key, by));
        }
        if let Some(over) = detector.over_field() {
            contents.push_str(&format!("{}.over = {}\n", key, over));
        }
        if let Some(partition) = detector.partition_field() {
            contents.push_str(&format!("{}.partition = {}\n", key, partition));
        }
    }

    contents
}

/// Write `contents` to a new temporary file in `dir`
pub fn write_temp_file(dir: &Path, prefix: &str, suffix: &str, contents: &str) -> Result<TempPath> {
    let mut file = Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| Error::launch_io(format!("Failed to create {} file", prefix), e))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| Error::launch_io(format!("Failed to write {} file", prefix), e))?;
    Ok(file.into_temp_path())
}

/// Write each detector state to `model_state{n}.xml` (n from 1, in key
/// order) inside a new temporary directory. Returns the directory and the
/// restore prefix `dir/model_state`.
pub fn write_state_files(parent: &Path, state: &PersistedState) -> Result<(TempDir, PathBuf)> {
    let dir = Builder::new()
        .prefix("model_state")
        .tempdir_in(parent)
        .map_err(|e| Error::launch_io("Failed to create state directory", e))?;

    for (number, (key, blob)) in state.iter().enumerate() {
        let path = dir
            .path()
            .join(format!("{}{}{}", STATE_FILE_BASE, number + 1, STATE_FILE_EXTENSION));
        let mut file = File::create(&path).map_err(|e| {
            Error::launch_io(format!("Failed to create state file {}", path.display()), e)
        })?;
        file.write_all(blob.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| {
                Error::launch_io(format!("Failed to write state of detector '{}'", key), e)
            })?;
    }

    let prefix = dir.path().join(STATE_FILE_BASE);
    Ok((dir, prefix))
}

/// Write a CSV table with a fixed `header` and one row per element
pub fn write_csv_table<T: Serialize>(
    dir: &Path,
    prefix: &str,
    header: &[&str],
    rows: &[T],
) -> Result<TempPath> {
    let file = Builder::new()
        .prefix(prefix)
        .suffix(".csv")
        .tempfile_in(dir)
        .map_err(|e| Error::launch_io(format!("Failed to create {} file", prefix), e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| Error::launch_io(format!("Failed to write {} file", prefix), e.into_error()))?;
    Ok(file.into_temp_path())
}
