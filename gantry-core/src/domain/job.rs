//! Job domain types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::backend::{BackendConfig, BackendState};
use crate::domain::files::OutputFile;
use crate::domain::status::JobStatus;
use crate::domain::time::JobTime;
use crate::dto::job::JobSpec;

/// The executable a job runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// How a master job is partitioned into subjobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitterSpec {
    /// One subjob per `files_per_job` input files
    ByFiles { files_per_job: usize },
    /// `count` identical subjobs
    Replicate { count: usize },
}

/// Bookkeeping that survives resubmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub uuid: Uuid,
    pub submit_counter: u32,
}

impl Default for JobInfo {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            submit_counter: 0,
        }
    }
}

impl JobInfo {
    pub fn increment(&mut self) {
        self.submit_counter += 1;
    }
}

/// Address of a job inside the registry: a root job, optionally one of its subjobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobRef {
    pub root: u64,
    pub sub: Option<usize>,
}

impl JobRef {
    pub fn root(id: u64) -> Self {
        Self { root: id, sub: None }
    }

    pub fn subjob(root: u64, index: usize) -> Self {
        Self {
            root,
            sub: Some(index),
        }
    }

    pub fn master(&self) -> Option<JobRef> {
        self.sub.map(|_| JobRef::root(self.root))
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            Some(index) => write!(f, "{}.{}", self.root, index),
            None => write!(f, "{}", self.root),
        }
    }
}

/// A unit of work and, for split jobs, the subjobs it owns
///
/// `status` is only changed by the [`StateMachine`](crate::state::StateMachine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub(crate) status: JobStatus,
    /// Id of the owning master; `None` for root jobs
    pub master: Option<u64>,
    pub name: String,
    pub application: Application,
    pub backend: BackendConfig,
    #[serde(default)]
    pub backend_state: BackendState,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default)]
    pub splitter: Option<SplitterSpec>,
    #[serde(default)]
    pub subjobs: Vec<Job>,
    #[serde(default)]
    pub time: JobTime,
    #[serde(default)]
    pub info: JobInfo,
    /// Already handed to the finalization queue
    #[serde(skip)]
    pub been_queued: bool,
}

impl Job {
    /// Creates a root job from a user description
    pub fn new(id: u64, spec: JobSpec) -> Self {
        let status = if spec.template {
            JobStatus::Template
        } else {
            JobStatus::New
        };
        let mut time = JobTime::new();
        time.record(status.as_str());

        Self {
            id,
            status,
            master: None,
            name: spec.name,
            application: spec.application,
            backend: spec.backend,
            backend_state: BackendState::default(),
            input_files: spec.input_files,
            output_files: spec.output_files,
            splitter: spec.splitter,
            subjobs: Vec::new(),
            time,
            info: JobInfo::default(),
            been_queued: false,
        }
    }

    /// Creates subjob `index` of this job, inheriting everything but its inputs
    pub fn make_subjob(&self, index: usize, input_files: Vec<String>) -> Job {
        let mut time = JobTime::new();
        time.record(JobStatus::New.as_str());

        Job {
            id: index as u64,
            status: JobStatus::New,
            master: Some(self.id),
            name: self.name.clone(),
            application: self.application.clone(),
            backend: self.backend.clone(),
            backend_state: BackendState::default(),
            input_files,
            output_files: self.output_files.iter().map(OutputFile::declaration).collect(),
            splitter: None,
            subjobs: Vec::new(),
            time,
            info: JobInfo::default(),
            been_queued: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Dot-joined id chain from the root
    pub fn fqid(&self) -> String {
        match self.master {
            Some(master) => format!("{}.{}", master, self.id),
            None => self.id.to_string(),
        }
    }

    pub fn is_subjob(&self) -> bool {
        self.master.is_some()
    }

    /// Registry address of this job
    pub fn job_ref(&self) -> JobRef {
        match self.master {
            Some(master) => JobRef::subjob(master, self.id as usize),
            None => JobRef::root(self.id),
        }
    }

    /// Resolves `sub` against this root job
    pub fn job(&self, sub: Option<usize>) -> Option<&Job> {
        match sub {
            None => Some(self),
            Some(index) => self.subjobs.get(index),
        }
    }

    pub fn job_mut(&mut self, sub: Option<usize>) -> Option<&mut Job> {
        match sub {
            None => Some(self),
            Some(index) => self.subjobs.get_mut(index),
        }
    }

    /// Distinct subjob statuses
    pub fn subjob_statuses(&self) -> BTreeSet<JobStatus> {
        self.subjobs.iter().map(|sj| sj.status).collect()
    }

    /// The jobs that are actually sent to the backend: the subjobs, or the job itself
    pub fn targets(&self) -> Vec<JobRef> {
        if self.subjobs.is_empty() {
            vec![self.job_ref()]
        } else {
            self.subjobs.iter().map(Job::job_ref).collect()
        }
    }

    /// Reasons the declared output files count as failed
    pub fn output_failures(&self, fail_if_unmatched: bool) -> Vec<String> {
        let mut reasons = Vec::new();
        for file in &self.output_files {
            if fail_if_unmatched && self.subjobs.is_empty() && !file.is_matched() {
                reasons.push(format!("{}: no file matched", file.pattern));
            }
            reasons.extend(file.failures());
        }
        reasons
    }
}
