//! Job workspaces
//!
//! Each job owns a directory under the workspace root: `<root>/<id>` for root
//! jobs and `<root>/<id>/<index>` for subjobs, each with `input/` and
//! `output/` areas.

use gantry_core::JobRef;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File in a job's output area recording where remote outputs were stored
pub const LOCATIONS_FILE: &str = "__postprocesslocations__";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job: JobRef) -> PathBuf {
        let dir = self.root.join(job.root.to_string());
        match job.sub {
            Some(index) => dir.join(index.to_string()),
            None => dir,
        }
    }

    pub fn input_dir(&self, job: JobRef) -> PathBuf {
        self.job_dir(job).join("input")
    }

    pub fn output_dir(&self, job: JobRef) -> PathBuf {
        self.job_dir(job).join("output")
    }

    pub fn locations_log(&self, job: JobRef) -> PathBuf {
        self.output_dir(job).join(LOCATIONS_FILE)
    }

    /// Creates the input and output areas of `job`
    pub fn create(&self, job: JobRef) -> io::Result<()> {
        fs::create_dir_all(self.input_dir(job))?;
        fs::create_dir_all(self.output_dir(job))?;
        Ok(())
    }

    /// Empties the output area of `job`
    pub fn clear_output(&self, job: JobRef) -> io::Result<()> {
        let dir = self.output_dir(job);
        remove_dir_if_exists(&dir)?;
        fs::create_dir_all(&dir)
    }

    /// Releases the workspace of `job` and everything below it
    ///
    /// With `preserve_top` the job directory itself is kept, empty.
    pub fn release(&self, job: JobRef, preserve_top: bool) -> io::Result<()> {
        let dir = self.job_dir(job);
        debug!("Releasing workspace {} (preserve top: {})", dir.display(), preserve_top);
        remove_dir_if_exists(&dir)?;
        if preserve_top {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
