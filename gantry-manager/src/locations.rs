//! Output location log
//!
//! Finalization appends one JSON line per discovered output file to the job's
//! `__postprocesslocations__` file. The file is never truncated, so reading it
//! after repeated attempts yields the latest record for every file. The
//! completed-transition hook reads it back to resolve output declarations.

use gantry_core::Job;
use gantry_core::domain::files::{FileKind, OutputFile};
use gantry_gateway::FileLocation;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::workspace::LOCATIONS_FILE;

/// Where one concrete output file was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Declared pattern the file matched
    pub pattern: String,
    /// Concrete file name
    pub name: String,
    #[serde(default)]
    pub lfn: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub guid: Option<String>,
}

/// Compiles an output pattern; `*` does not cross directories
pub fn compile(pattern: &str) -> Result<GlobMatcher, JobError> {
    let mut builder = GlobBuilder::new(pattern);
    builder.literal_separator(true);
    builder
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| JobError::Validation(format!("invalid output pattern '{}': {}", pattern, e)))
}

/// Appends `records` to the log at `path`
pub async fn append_records(path: &Path, records: &[LocationRecord]) -> Result<(), JobError> {
    if records.is_empty() {
        return Ok(());
    }

    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)
            .map_err(|e| JobError::Protocol(format!("unserializable location record: {}", e)))?;
        buf.push(b'\n');
    }

    let write = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await
    };
    write
        .await
        .map_err(|e: io::Error| JobError::from_write(e, &path.display().to_string()))?;

    debug!("Appended {} location record(s) to {}", records.len(), path.display());
    Ok(())
}

/// Reads every record in the log at `path`; a missing log is empty
pub fn read_records(path: &Path) -> Result<Vec<LocationRecord>, JobError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "Skipping malformed line {} of {}: {}",
                number + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(records)
}

/// Matches uploaded files reported by the remote service against remote declarations
pub fn records_for(
    output_files: &[OutputFile],
    output_data: &BTreeMap<String, FileLocation>,
) -> Result<Vec<LocationRecord>, JobError> {
    let mut records = Vec::new();
    for file in output_files.iter().filter(|f| f.kind == FileKind::Remote) {
        let matcher = compile(&file.pattern)?;
        for (name, location) in output_data {
            if matcher.is_match(name) {
                records.push(LocationRecord {
                    pattern: file.pattern.clone(),
                    name: name.clone(),
                    lfn: Some(location.lfn.clone()),
                    locations: location.locations.clone(),
                    guid: location.guid.clone(),
                });
            }
        }
    }
    Ok(records)
}

/// Matches downloaded sandbox files under `output_dir` against sandbox declarations
pub fn sandbox_records(
    output_files: &[OutputFile],
    output_dir: &Path,
) -> Result<Vec<LocationRecord>, JobError> {
    let mut present = Vec::new();
    collect_files(output_dir, output_dir, &mut present)?;

    let mut records = Vec::new();
    for file in output_files.iter().filter(|f| f.kind == FileKind::Sandbox) {
        let matcher = compile(&file.pattern)?;
        for name in present.iter().filter(|name| matcher.is_match(name.as_str())) {
            records.push(LocationRecord {
                pattern: file.pattern.clone(),
                name: name.clone(),
                lfn: None,
                locations: vec![output_dir.join(name).display().to_string()],
                guid: None,
            });
        }
    }
    Ok(records)
}

fn collect_files(base: &Path, dir: &Path, found: &mut Vec<String>) -> Result<(), JobError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(base, &path, found)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            let name = relative.to_string_lossy().replace('\\', "/");
            if name != LOCATIONS_FILE {
                found.push(name);
            }
        }
    }
    found.sort();
    Ok(())
}

/// Resolves the output declarations of `job` from `records`
///
/// Later records for the same file win. Returns the number of records applied.
pub fn apply_records(job: &mut Job, records: &[LocationRecord]) -> usize {
    let mut applied = 0;
    for record in records {
        let Some(file) = job
            .output_files
            .iter_mut()
            .find(|f| f.pattern == record.pattern)
        else {
            debug!(
                "Job {}: no declaration for output pattern {}",
                job.fqid(),
                record.pattern
            );
            continue;
        };
        file.resolve(
            &record.name,
            record.lfn.clone(),
            record.locations.clone(),
            record.guid.clone(),
        );
        applied += 1;
    }
    applied
}
