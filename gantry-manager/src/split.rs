//! Splitting
//!
//! A splitter partitions a master job into subjobs before submission. The
//! returned subjobs are recorded on the master before any remote call.

use gantry_core::Job;
use gantry_core::domain::job::SplitterSpec;

use crate::error::JobError;

/// Partitions a master job into subjobs
pub trait Splitter: Send + Sync {
    /// Returns the subjobs of `master`, or an empty list if it is not split
    fn split(&self, master: &Job) -> Result<Vec<Job>, JobError>;
}

/// Splitter driven by the job's own [`SplitterSpec`]
pub struct StandardSplitter;

impl Splitter for StandardSplitter {
    fn split(&self, master: &Job) -> Result<Vec<Job>, JobError> {
        let Some(spec) = &master.splitter else {
            return Ok(Vec::new());
        };

        let subjobs: Vec<Job> = match spec {
            SplitterSpec::ByFiles { files_per_job } => {
                if *files_per_job == 0 {
                    return Err(JobError::Split("files_per_job must be greater than 0".into()));
                }
                master
                    .input_files
                    .chunks(*files_per_job)
                    .enumerate()
                    .map(|(index, files)| master.make_subjob(index, files.to_vec()))
                    .collect()
            }
            SplitterSpec::Replicate { count } => (0..*count)
                .map(|index| master.make_subjob(index, master.input_files.clone()))
                .collect(),
        };

        if subjobs.is_empty() {
            return Err(JobError::Split(format!(
                "splitter of job {} produced no subjobs",
                master.fqid()
            )));
        }

        Ok(subjobs)
    }
}
