//! Finalization engine
//!
//! Collects the output of jobs the remote service reports as finished and
//! moves them to their terminal status. Single-job finalization retries
//! transient errors a bounded number of times; bulk finalization handles
//! split jobs whose backend finalises on the master, and jobs left in
//! `completing`.
//!
//! Whether a job may still be finalised is decided in one place,
//! [`finalise_gate`], which every path consults under the tree lock before
//! doing remote work and again before committing.

use gantry_core::domain::backend::CredentialRequirement;
use gantry_core::domain::files::OutputFile;
use gantry_core::{Job, JobRef, JobStatus, UpdateOptions};
use gantry_gateway::{
    FinaliseEntry, FinaliseJobsReply, FinishedJobReply, GatewayError, RemoteCommand, SandboxResult,
};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::ManagerContext;
use crate::error::JobError;
use crate::locations::{self, LocationRecord};
use crate::pool::{FINALISE_PRIORITY, TaskHandle};

/// Outcome of the finalization precondition check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinaliseGate {
    Proceed,
    Skip(&'static str),
}

/// Decides whether a job in `status` may still be finalised
///
/// `retry` admits a job already parked in `completing` by an earlier attempt
/// of the same finalization.
pub fn finalise_gate(status: JobStatus, master: Option<JobStatus>, retry: bool) -> FinaliseGate {
    if master.is_some_and(|m| m.is_withdrawn()) {
        return FinaliseGate::Skip("master was killed or removed");
    }
    match status {
        JobStatus::Submitted | JobStatus::Running => FinaliseGate::Proceed,
        JobStatus::Completing if retry => FinaliseGate::Proceed,
        JobStatus::Completing => FinaliseGate::Skip("already being finalised"),
        JobStatus::Killed | JobStatus::Removed => FinaliseGate::Skip("killed or removed"),
        _ => FinaliseGate::Skip("already final"),
    }
}

/// Statuses a subjob may be in when its master is finalised in bulk
fn is_finishable(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Completing
            | JobStatus::Failed
            | JobStatus::Killed
            | JobStatus::Removed
            | JobStatus::Completed
    )
}

/// What a single attempt has to do after the gate
enum Plan {
    Skip,
    Park { master_ready: bool },
    Collect(Target),
    Fail(Target),
}

/// Everything a remote finalization call needs, copied out of the tree
#[derive(Debug, Clone)]
struct Target {
    job: JobRef,
    remote_id: i64,
    credential: CredentialRequirement,
    output_files: Vec<OutputFile>,
    output_dir: PathBuf,
    download_sandbox: bool,
    unpack: bool,
}

impl Target {
    fn of(ctx: &ManagerContext, job: &Job) -> Result<Self, JobError> {
        let remote_id = job.backend_state.remote_id.ok_or_else(|| {
            JobError::InvalidState(format!("job {} has no remote id", job.fqid()))
        })?;
        Ok(Self {
            job: job.job_ref(),
            remote_id,
            credential: job.backend.credential.clone(),
            output_files: job.output_files.clone(),
            output_dir: ctx.workspace.output_dir(job.job_ref()),
            download_sandbox: job.backend.download_sandbox,
            unpack: job.backend.unpack_sandbox,
        })
    }
}

/// Clears a job's queued flag when dropped
struct QueuedFlag {
    ctx: Arc<ManagerContext>,
    job: JobRef,
}

impl QueuedFlag {
    fn new(ctx: Arc<ManagerContext>, job: JobRef) -> Self {
        Self { ctx, job }
    }
}

impl Drop for QueuedFlag {
    fn drop(&mut self) {
        // The tree lock may be poisoned while unwinding
        if std::thread::panicking() {
            return;
        }
        let job = self.job;
        let _ = self.ctx.registry.with_root(job, |root| {
            if let Some(target) = root.job_mut(job.sub) {
                target.been_queued = false;
            }
        });
    }
}

#[derive(Clone)]
pub struct FinalisationEngine {
    ctx: Arc<ManagerContext>,
}

impl FinalisationEngine {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        Self { ctx }
    }

    /// Finalises `job`, whose remote status maps to `terminal`
    ///
    /// Makes at most `finalise_attempts` attempts. A disk-space error is not
    /// retried. When no attempt succeeds the job is forced to `failed` and the
    /// last error returned. The job's queued flag is cleared in every case.
    pub async fn job_finalisation(&self, job: JobRef, terminal: JobStatus) -> Result<(), JobError> {
        let _queued = QueuedFlag::new(Arc::clone(&self.ctx), job);
        self.finalise_with_retries(job, terminal).await
    }

    /// Builds the pool task finalising `job`
    ///
    /// The queued flag is cleared when the task ends, and also when the task
    /// is dropped before it ever runs.
    pub fn queued_finalisation(
        &self,
        job: JobRef,
        terminal: JobStatus,
    ) -> impl Future<Output = ()> + Send + 'static {
        let queued = QueuedFlag::new(Arc::clone(&self.ctx), job);
        let engine = self.clone();
        async move {
            let _queued = queued;
            if let Err(e) = engine.finalise_with_retries(job, terminal).await {
                error!("Job {}: finalization failed: {}", job, e);
            }
        }
    }

    async fn finalise_with_retries(&self, job: JobRef, terminal: JobStatus) -> Result<(), JobError> {
        let attempts = self.ctx.config.finalise_attempts;
        let mut result = Ok(());

        for attempt in 1..=attempts {
            match self.attempt(job, terminal, attempt > 1).await {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(e) if e.is_disk_space() => {
                    error!("Job {}: finalization stopped, disk is full: {}", job, e);
                    self.force_failed(job);
                    result = Err(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Job {}: finalization attempt {}/{} failed: {}",
                        job, attempt, attempts, e
                    );
                    if attempt == attempts {
                        error!("Job {}: finalization failed {} times, giving up", job, attempts);
                        self.force_failed(job);
                        result = Err(e);
                    } else {
                        tokio::time::sleep(self.ctx.config.finalise_backoff).await;
                    }
                }
            }
        }

        result
    }

    async fn attempt(&self, job: JobRef, terminal: JobStatus, retry: bool) -> Result<(), JobError> {
        let Some(tree) = self.ctx.registry.get(job.root) else {
            debug!("Job {} no longer exists, nothing to finalise", job);
            return Ok(());
        };

        let plan = {
            let mut root = tree.lock().unwrap();
            let master = job.sub.map(|_| root.status());
            let target = root
                .job(job.sub)
                .ok_or_else(|| JobError::NotFound(job.to_string()))?;

            match finalise_gate(target.status(), master, retry) {
                FinaliseGate::Skip(reason) => {
                    debug!("Job {}: not finalising, {}", job, reason);
                    Plan::Skip
                }
                FinaliseGate::Proceed if terminal != JobStatus::Completed => {
                    Plan::Fail(Target::of(&self.ctx, target)?)
                }
                FinaliseGate::Proceed if job.sub.is_some() && target.backend.finalise_on_master => {
                    self.ctx.machine.update_status(
                        &mut root,
                        job.sub,
                        JobStatus::Completing,
                        UpdateOptions::local(),
                    )?;
                    let master_ready = root.subjobs.iter().all(|sj| is_finishable(sj.status()));
                    Plan::Park { master_ready }
                }
                FinaliseGate::Proceed => {
                    let target = Target::of(&self.ctx, target)?;
                    self.ctx.machine.update_status(
                        &mut root,
                        job.sub,
                        JobStatus::Completing,
                        UpdateOptions::default(),
                    )?;
                    Plan::Collect(target)
                }
            }
        };

        match plan {
            Plan::Skip => Ok(()),
            Plan::Park { master_ready } => {
                debug!("Job {} parked until its master is finalised", job);
                if master_ready {
                    info!("All subjobs of job {} finished, finalising in bulk", job.root);
                    let subjobs = self.subjobs_of(job.root);
                    // Not awaited; this attempt may be running on a pool worker
                    drop(self.finalise_jobs(subjobs));
                }
                Ok(())
            }
            Plan::Collect(target) => self.collect(target).await,
            Plan::Fail(target) => self.fail(target).await,
        }
    }

    /// Downloads output and metadata, then commits `completed`
    async fn collect(&self, target: Target) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&target.output_dir)
            .await
            .map_err(|e| JobError::from_write(e, &target.output_dir.display().to_string()))?;

        let reply: FinishedJobReply = self
            .ctx
            .remote(
                &target.credential,
                RemoteCommand::FinishedJob {
                    id: target.remote_id,
                    output_dir: target.output_dir.clone(),
                    download_sandbox: target.download_sandbox,
                    unpack: target.unpack,
                },
            )
            .await?;

        check_sandbox("finished_job", &reply.sandbox)?;

        let records = locations::records_for(&target.output_files, &reply.output_data)?;
        let log = self.ctx.workspace.locations_log(target.job);
        locations::append_records(&log, &records).await?;

        self.commit(
            target.job,
            |job| {
                job.backend_state.norm_cpu_time = reply.cpu_time.clone();
                if let Some(at) = reply.completed_at {
                    job.time.record_backend("final", at);
                }
            },
            JobStatus::Completed,
            UpdateOptions::default(),
        )
    }

    /// Optionally downloads the sandbox of a failed job, then commits `failed`
    async fn fail(&self, target: Target) -> Result<(), JobError> {
        if self.ctx.config.failed_sandbox_download && target.download_sandbox {
            let download: Result<SandboxResult, JobError> = self
                .ctx
                .remote(
                    &target.credential,
                    RemoteCommand::GetSandbox {
                        id: target.remote_id,
                        output_dir: target.output_dir.clone(),
                        unpack: target.unpack,
                    },
                )
                .await;
            match download.and_then(|sandbox| check_sandbox("get_sandbox", &sandbox)) {
                Ok(()) => {}
                Err(e) if e.is_disk_space() => return Err(e),
                Err(e) => warn!("Job {}: sandbox of failed job not retrieved: {}", target.job, e),
            }
        }

        self.commit(target.job, |_| {}, JobStatus::Failed, UpdateOptions::default())
    }

    /// Applies `update` and moves the job to `status`, if the gate still allows it
    fn commit(
        &self,
        job: JobRef,
        update: impl FnOnce(&mut Job),
        status: JobStatus,
        opts: UpdateOptions,
    ) -> Result<(), JobError> {
        let Some(tree) = self.ctx.registry.get(job.root) else {
            return Ok(());
        };
        let mut root = tree.lock().unwrap();
        let master = job.sub.map(|_| root.status());
        let Some(target) = root.job_mut(job.sub) else {
            return Err(JobError::NotFound(job.to_string()));
        };

        if let FinaliseGate::Skip(reason) = finalise_gate(target.status(), master, true) {
            info!("Job {}: result discarded, {}", job, reason);
            return Ok(());
        }

        update(target);
        let committed = self.ctx.machine.update_status(&mut root, job.sub, status, opts)?;
        info!("Job {} finalised as {}", job, committed);
        Ok(())
    }

    fn force_failed(&self, job: JobRef) {
        let result = self.ctx.registry.with_root(job, |root| {
            self.ctx.machine.force_status(root, job.sub, JobStatus::Failed)
        });
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Job {}: not forced to failed: {}", job, e),
            Err(e) => debug!("Job {}: not forced to failed: {}", job, e),
        }
    }

    fn subjobs_of(&self, id: u64) -> Vec<JobRef> {
        self.ctx
            .registry
            .get(id)
            .map(|tree| tree.lock().unwrap().subjobs.iter().map(Job::job_ref).collect())
            .unwrap_or_default()
    }

    /// Finalises `jobs` in bulk, one pool task per chunk
    ///
    /// Jobs that are not `completing`, `failed`, `killed` or `removed` are
    /// ignored. Only `completing` jobs change status.
    pub fn finalise_jobs(&self, jobs: Vec<JobRef>) -> Vec<TaskHandle<()>> {
        let mut by_credential: HashMap<CredentialRequirement, Vec<Target>> = HashMap::new();
        for job in jobs {
            let target = self.ctx.registry.with_root(job, |root| {
                let j = root.job(job.sub)?;
                let eligible = matches!(
                    j.status(),
                    JobStatus::Completing | JobStatus::Failed | JobStatus::Killed | JobStatus::Removed
                );
                eligible.then(|| Target::of(&self.ctx, j).ok()).flatten()
            });
            if let Ok(Some(target)) = target {
                by_credential
                    .entry(target.credential.clone())
                    .or_default()
                    .push(target);
            }
        }

        let mut handles = Vec::new();
        for (credential, targets) in by_credential {
            for chunk in targets.chunks(self.ctx.config.max_subjobs_per_finalise) {
                let engine = self.clone();
                let credential = credential.clone();
                let chunk = chunk.to_vec();
                handles.push(self.ctx.pool.add_function(
                    format!("finalise {} job(s)", chunk.len()),
                    FINALISE_PRIORITY,
                    async move { engine.finalise_chunk(&credential, chunk).await },
                ));
            }
        }
        handles
    }

    async fn finalise_chunk(&self, credential: &CredentialRequirement, chunk: Vec<Target>) {
        let command = RemoteCommand::FinaliseJobs {
            jobs: chunk
                .iter()
                .map(|t| FinaliseEntry {
                    id: t.remote_id,
                    output_dir: t.output_dir.clone(),
                })
                .collect(),
            download_sandbox: chunk.iter().any(|t| t.download_sandbox),
            unpack: chunk.iter().any(|t| t.unpack),
        };

        let reply: FinaliseJobsReply = match self.ctx.remote(credential, command).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Bulk finalization of {} job(s) failed: {}", chunk.len(), e);
                FinaliseJobsReply::default()
            }
        };

        let mut masters = BTreeSet::new();
        for target in chunk {
            if target.job.sub.is_some() {
                masters.insert(target.job.root);
            }
            if let Err(e) = self.apply_bulk_result(&target, &reply).await {
                warn!("Job {}: bulk finalization failed: {}", target.job, e);
                self.force_failed(target.job);
            }
        }

        for id in masters {
            let result = self.ctx.registry.with_root(JobRef::root(id), |root| {
                self.ctx.machine.update_master_status(root)
            });
            if let Ok(Err(e)) = result {
                warn!("Job {}: master status not updated: {}", id, e);
            }
        }
    }

    async fn apply_bulk_result(
        &self,
        target: &Target,
        reply: &FinaliseJobsReply,
    ) -> Result<(), JobError> {
        let still_completing = self.ctx.registry.status(target.job)? == JobStatus::Completing;
        if !still_completing {
            return Ok(());
        }

        let result = reply.results.get(&target.remote_id).ok_or_else(|| {
            JobError::Protocol(format!("no finalization result for remote id {}", target.remote_id))
        })?;
        check_sandbox("finalise_jobs", &result.sandbox)?;

        let records: Vec<LocationRecord> =
            locations::records_for(&target.output_files, &result.output_data)?;
        let log = self.ctx.workspace.locations_log(target.job);
        locations::append_records(&log, &records).await?;

        let status = reply
            .statuses
            .get(&target.remote_id)
            .and_then(|remote| self.ctx.config.finalised_status(remote))
            .unwrap_or(JobStatus::Completed);

        self.commit(
            target.job,
            |job| {
                job.backend_state.norm_cpu_time = result.cpu_time.clone();
                if let Some(at) = result.completed_at {
                    job.time.record_backend("final", at);
                }
            },
            status,
            UpdateOptions::local(),
        )
    }
}

fn check_sandbox(command: &str, sandbox: &SandboxResult) -> Result<(), JobError> {
    if sandbox.ok {
        return Ok(());
    }
    let message = sandbox
        .message
        .clone()
        .unwrap_or_else(|| "output sandbox download failed".to_string());
    Err(JobError::Backend(GatewayError::remote(command, message)))
}
