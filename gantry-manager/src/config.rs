//! Manager configuration
//!
//! Defines the tunables of the job manager: polling intervals, batch sizes,
//! retry limits, and the remote status vocabularies.

use gantry_core::JobStatus;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Job manager configuration
///
/// All timeouts, batch sizes and retry limits are configurable to allow
/// tuning for different middleware deployments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding per-job input/output workspaces
    pub workspace_root: PathBuf,

    /// How often the monitoring loop polls the remote service
    pub poll_interval: Duration,

    /// Number of worker tasks draining the task queue
    pub worker_count: usize,

    /// Timeout of a single remote command
    pub gateway_timeout: Duration,

    /// Maximum number of jobs embedded in one submission script
    pub max_subjobs_per_batch: usize,

    /// Maximum number of jobs finalised by one bulk remote call
    pub max_subjobs_per_finalise: usize,

    /// Dispatch submission batches onto the worker pool
    pub parallel_submit: bool,

    /// How often a submission waits to re-check a batch
    pub submit_poll_interval: Duration,

    /// Finalization attempts before a job is forced to failed
    pub finalise_attempts: u32,

    /// Sleep between finalization attempts
    pub finalise_backoff: Duration,

    /// Finalise jobs inline in the monitoring loop instead of on the pool
    pub serialize_backend: bool,

    /// Resubmit only failed subjobs rather than every subjob
    pub resubmit_only_failed: bool,

    /// Submission count ceiling for automatic resubmission
    pub max_resubmits: u32,

    /// Fail completed jobs whose declared output matched nothing
    pub fail_if_no_output_matched: bool,

    /// Download the output sandbox of failed jobs too
    pub failed_sandbox_download: bool,

    /// Remote status -> local status
    pub status_mapping: HashMap<String, JobStatus>,

    /// Remote statuses after which a job is finalised, and the local status it ends in
    pub finalised_statuses: HashMap<String, JobStatus>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            poll_interval: Duration::from_secs(30),
            worker_count: 4,
            gateway_timeout: Duration::from_secs(120),
            max_subjobs_per_batch: 100,
            max_subjobs_per_finalise: 50,
            parallel_submit: true,
            submit_poll_interval: Duration::from_secs(1),
            finalise_attempts: 5,
            finalise_backoff: Duration::from_millis(2500),
            serialize_backend: false,
            resubmit_only_failed: true,
            max_resubmits: 3,
            fail_if_no_output_matched: true,
            failed_sandbox_download: true,
            status_mapping: default_status_mapping(),
            finalised_statuses: default_finalised_statuses(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - GANTRY_WORKSPACE (default: ./gantry-workspace)
    /// - GANTRY_POLL_INTERVAL (seconds, default: 30)
    /// - GANTRY_WORKERS (default: 4)
    /// - GANTRY_GATEWAY_TIMEOUT (seconds, default: 120)
    /// - GANTRY_MAX_SUBJOBS_PER_BATCH (default: 100)
    /// - GANTRY_MAX_SUBJOBS_PER_FINALISE (default: 50)
    /// - GANTRY_PARALLEL_SUBMIT (default: true)
    /// - GANTRY_FINALISE_ATTEMPTS (default: 5)
    /// - GANTRY_SERIALIZE_BACKEND (default: false)
    /// - GANTRY_RESUBMIT_ONLY_FAILED (default: true)
    /// - GANTRY_MAX_RESUBMITS (default: 3)
    /// - GANTRY_FAIL_IF_NO_OUTPUT (default: true)
    /// - GANTRY_FAILED_SANDBOX_DOWNLOAD (default: true)
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace_root = std::env::var("GANTRY_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./gantry-workspace"));

        let mut config = Self::new(workspace_root);

        if let Some(secs) = env_parse::<u64>("GANTRY_POLL_INTERVAL")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(workers) = env_parse("GANTRY_WORKERS")? {
            config.worker_count = workers;
        }
        if let Some(secs) = env_parse::<u64>("GANTRY_GATEWAY_TIMEOUT")? {
            config.gateway_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse("GANTRY_MAX_SUBJOBS_PER_BATCH")? {
            config.max_subjobs_per_batch = size;
        }
        if let Some(size) = env_parse("GANTRY_MAX_SUBJOBS_PER_FINALISE")? {
            config.max_subjobs_per_finalise = size;
        }
        if let Some(flag) = env_parse("GANTRY_PARALLEL_SUBMIT")? {
            config.parallel_submit = flag;
        }
        if let Some(attempts) = env_parse("GANTRY_FINALISE_ATTEMPTS")? {
            config.finalise_attempts = attempts;
        }
        if let Some(flag) = env_parse("GANTRY_SERIALIZE_BACKEND")? {
            config.serialize_backend = flag;
        }
        if let Some(flag) = env_parse("GANTRY_RESUBMIT_ONLY_FAILED")? {
            config.resubmit_only_failed = flag;
        }
        if let Some(max) = env_parse("GANTRY_MAX_RESUBMITS")? {
            config.max_resubmits = max;
        }
        if let Some(flag) = env_parse("GANTRY_FAIL_IF_NO_OUTPUT")? {
            config.fail_if_no_output_matched = flag;
        }
        if let Some(flag) = env_parse("GANTRY_FAILED_SANDBOX_DOWNLOAD")? {
            config.failed_sandbox_download = flag;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            anyhow::bail!("workspace_root cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.gateway_timeout.is_zero() {
            anyhow::bail!("gateway_timeout must be greater than 0");
        }

        if self.max_subjobs_per_batch == 0 || self.max_subjobs_per_finalise == 0 {
            anyhow::bail!("batch sizes must be greater than 0");
        }

        if self.finalise_attempts == 0 {
            anyhow::bail!("finalise_attempts must be greater than 0");
        }

        for (remote, local) in &self.finalised_statuses {
            if !matches!(local, JobStatus::Completed | JobStatus::Failed) {
                anyhow::bail!(
                    "finalised status '{}' must map to completed or failed, not {}",
                    remote,
                    local
                );
            }
        }

        for (remote, local) in &self.status_mapping {
            if matches!(
                local,
                JobStatus::New | JobStatus::Template | JobStatus::Removed | JobStatus::Incomplete
            ) {
                anyhow::bail!("remote status '{}' cannot map to {}", remote, local);
            }
        }

        Ok(())
    }

    /// Local status for a remote status string
    pub fn map_remote_status(&self, remote: &str) -> Option<JobStatus> {
        self.status_mapping.get(remote).copied()
    }

    /// Final local status if `remote` means the job is done remotely
    pub fn finalised_status(&self, remote: &str) -> Option<JobStatus> {
        self.finalised_statuses.get(remote).copied()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("./gantry-workspace"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn default_status_mapping() -> HashMap<String, JobStatus> {
    let mut mapping = HashMap::new();
    for remote in ["Waiting", "Matched", "Received", "Checking", "Staging", "Scheduled"] {
        mapping.insert(remote.to_string(), JobStatus::Submitted);
    }
    mapping.insert("Running".to_string(), JobStatus::Running);
    mapping.insert("Completing".to_string(), JobStatus::Running);
    mapping.insert("Done".to_string(), JobStatus::Completed);
    for remote in ["Failed", "Stalled", "Killed", "Deleted"] {
        mapping.insert(remote.to_string(), JobStatus::Failed);
    }
    mapping
}

fn default_finalised_statuses() -> HashMap<String, JobStatus> {
    let mut finalised = HashMap::new();
    finalised.insert("Done".to_string(), JobStatus::Completed);
    for remote in ["Failed", "Killed", "Deleted", "Stalled"] {
        finalised.insert(remote.to_string(), JobStatus::Failed);
    }
    finalised
}
