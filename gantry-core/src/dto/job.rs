//! Job DTOs

use serde::{Deserialize, Serialize};

use crate::domain::backend::BackendConfig;
use crate::domain::files::OutputFile;
use crate::domain::job::{Application, Job, SplitterSpec};
use crate::domain::status::JobStatus;

/// Request to create a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub application: Application,
    pub backend: BackendConfig,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default)]
    pub splitter: Option<SplitterSpec>,
    /// Create the job as a template that can never be submitted
    #[serde(default)]
    pub template: bool,
}

/// Point-in-time copy of a job's observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub fqid: String,
    pub name: String,
    pub status: JobStatus,
    pub remote_id: Option<i64>,
    pub remote_status: Option<String>,
    pub site: Option<String>,
    pub submit_counter: u32,
    pub been_queued: bool,
    pub subjobs: Vec<JobSnapshot>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            fqid: job.fqid(),
            name: job.name.clone(),
            status: job.status(),
            remote_id: job.backend_state.remote_id,
            remote_status: job.backend_state.remote_status.clone(),
            site: job.backend_state.site.clone(),
            submit_counter: job.info.submit_counter,
            been_queued: job.been_queued,
            subjobs: job.subjobs.iter().map(JobSnapshot::from).collect(),
        }
    }
}

impl JobSnapshot {
    /// Number of subjobs per status, for summaries
    pub fn status_counts(&self) -> std::collections::BTreeMap<JobStatus, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for sj in &self.subjobs {
            *counts.entry(sj.status).or_insert(0) += 1;
        }
        counts
    }
}
