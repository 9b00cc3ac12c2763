//! Remote command vocabulary
//!
//! Every remote operation is one `RemoteCommand` serialized as JSON and
//! handed to the gateway. Replies are decoded into the typed structures
//! below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One member of a submission batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Fully-qualified id of the local job
    pub key: String,
    /// Backend-specific job description
    pub payload: serde_json::Value,
}

/// A job whose output should be collected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinaliseEntry {
    pub id: i64,
    pub output_dir: PathBuf,
}

/// Commands understood by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Submit every entry in one script; replies with a [`SubmitReply`]
    SubmitBatch { entries: Vec<BatchEntry> },
    /// Bulk status query; replies with one [`StatusEntry`] per id, in order
    Status { ids: Vec<i64> },
    /// First time each job entered `state`; replies with a [`StateTimesReply`]
    StateTimes { ids: Vec<i64>, state: String },
    /// Download output and completion metadata of one job
    FinishedJob {
        id: i64,
        output_dir: PathBuf,
        download_sandbox: bool,
        unpack: bool,
    },
    /// Bulk variant of `FinishedJob`
    FinaliseJobs {
        jobs: Vec<FinaliseEntry>,
        download_sandbox: bool,
        unpack: bool,
    },
    /// Download only the output sandbox
    GetSandbox {
        id: i64,
        output_dir: PathBuf,
        unpack: bool,
    },
    Kill { ids: Vec<i64> },
    /// Release remote artifacts of removed jobs
    Remove { ids: Vec<i64> },
}

impl RemoteCommand {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::SubmitBatch { .. } => "submit_batch",
            RemoteCommand::Status { .. } => "status",
            RemoteCommand::StateTimes { .. } => "state_times",
            RemoteCommand::FinishedJob { .. } => "finished_job",
            RemoteCommand::FinaliseJobs { .. } => "finalise_jobs",
            RemoteCommand::GetSandbox { .. } => "get_sandbox",
            RemoteCommand::Kill { .. } => "kill",
            RemoteCommand::Remove { .. } => "remove",
        }
    }
}

/// Per-entry result of a batch submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitOutcome {
    /// Accepted; the remote id
    Id(i64),
    /// Rejected; the reason
    Reason(String),
    /// Anything else the service sent back
    Other(serde_json::Value),
}

/// Batch submission result keyed by entry key
pub type SubmitReply = BTreeMap<String, SubmitOutcome>;

/// Remote view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    #[serde(default)]
    pub status_info: String,
    pub remote_status: String,
    #[serde(default)]
    pub site: Option<String>,
    /// Local status suggested by the service
    #[serde(default)]
    pub local_status: Option<String>,
}

/// State entry times keyed by remote id
pub type StateTimesReply = BTreeMap<i64, DateTime<Utc>>;

/// Outcome of an output sandbox download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl SandboxResult {
    pub fn skipped() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }
}

/// Where a remote output file was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLocation {
    pub lfn: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub guid: Option<String>,
}

/// Completion metadata of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedJobReply {
    #[serde(default)]
    pub cpu_time: Option<String>,
    pub sandbox: SandboxResult,
    /// Uploaded output files keyed by file name
    #[serde(default)]
    pub output_data: BTreeMap<String, FileLocation>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Reply to `FinaliseJobs`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinaliseJobsReply {
    #[serde(default)]
    pub results: BTreeMap<i64, FinishedJobReply>,
    /// Final remote status per id
    #[serde(default)]
    pub statuses: BTreeMap<i64, String>,
}
