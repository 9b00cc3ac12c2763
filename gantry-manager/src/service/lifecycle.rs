//! Job lifecycle
//!
//! The user-facing operations: submit, kill, remove, resubmit and
//! auto-resubmit. Each one validates the job's status under its root lock,
//! performs remote work with the lock released, and settles the job into a
//! consistent status before returning, also on failure.

use gantry_core::domain::backend::{BackendConfig, CredentialRequirement};
use gantry_core::domain::resubmit::check_changes;
use gantry_core::dto::job::{JobSnapshot, JobSpec};
use gantry_core::{Job, JobRef, JobStatus, UpdateOptions};
use gantry_gateway::RemoteCommand;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::context::ManagerContext;
use crate::error::JobError;
use crate::pool::TaskHandle;
use crate::runtime::{RuntimeHandler, StandardRuntime};
use crate::service::finalisation::FinalisationEngine;
use crate::service::submission::{SubmissionEngine, SubmissionReport, SubmissionTarget};
use crate::split::{Splitter, StandardSplitter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Keep submitting remaining batches when one fails
    pub keep_going: bool,
    /// Leave a job that failed to submit in `failed` instead of rolling back to `new`
    pub keep_on_fail: bool,
}

/// Which targets a resubmission picks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResubmitScope {
    /// User request, following `resubmit_only_failed`
    Requested,
    /// Failed subjobs still below the resubmission ceiling
    Automatic,
}

/// Statuses the targets of an operation had before it started
type Saved = Vec<(JobRef, JobStatus)>;

pub struct JobManager {
    ctx: Arc<ManagerContext>,
    splitter: Arc<dyn Splitter>,
    runtime: Arc<dyn RuntimeHandler>,
    submission: SubmissionEngine,
    finaliser: FinalisationEngine,
}

impl JobManager {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        Self::with_handlers(ctx, Arc::new(StandardSplitter), Arc::new(StandardRuntime))
    }

    pub fn with_handlers(
        ctx: Arc<ManagerContext>,
        splitter: Arc<dyn Splitter>,
        runtime: Arc<dyn RuntimeHandler>,
    ) -> Self {
        Self {
            submission: SubmissionEngine::new(Arc::clone(&ctx)),
            finaliser: FinalisationEngine::new(Arc::clone(&ctx)),
            ctx,
            splitter,
            runtime,
        }
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.ctx
    }

    pub fn create_job(&self, spec: JobSpec) -> JobRef {
        let job = self.ctx.registry.create(spec);
        info!("Created job {}", job);
        job
    }

    pub fn snapshot(&self, id: u64) -> Option<JobSnapshot> {
        self.ctx.registry.snapshot(id)
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.ctx.registry.snapshots()
    }

    /// Submits a new root job, splitting it first if it has a splitter
    pub async fn submit(&self, id: u64, opts: SubmitOptions) -> Result<SubmissionReport, JobError> {
        let tree = self.ctx.registry.tree(id)?;
        let (requirement, targets) = {
            let mut root = tree.lock().unwrap();
            match root.status() {
                JobStatus::New => {}
                JobStatus::Template => {
                    return Err(JobError::InvalidState(format!(
                        "job {} is a template and cannot be submitted",
                        id
                    )));
                }
                other => {
                    return Err(JobError::InvalidState(format!(
                        "job {} is {}, only new jobs can be submitted",
                        id, other
                    )));
                }
            }
            if !root.subjobs.is_empty() {
                return Err(JobError::InvalidState(format!(
                    "job {} already has subjobs",
                    id
                )));
            }

            self.ctx.machine.update_status(
                &mut root,
                None,
                JobStatus::Submitting,
                UpdateOptions::default(),
            )?;

            match self.prepare_submission(&mut root) {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!("Job {}: submission not prepared: {}", id, e);
                    self.roll_back(&mut root, opts.keep_on_fail);
                    return Err(e);
                }
            }
        };

        let result = self
            .submission
            .submit(&requirement, targets, opts.keep_going)
            .await;

        let mut root = tree.lock().unwrap();
        match result {
            Ok(report) => {
                if root.subjobs.is_empty() {
                    if root.status() == JobStatus::Submitting {
                        self.ctx.machine.update_status(
                            &mut root,
                            None,
                            JobStatus::Failed,
                            UpdateOptions::default(),
                        )?;
                    }
                } else {
                    root.info.increment();
                    self.ctx.machine.update_master_status(&mut root)?;
                }
                Ok(report)
            }
            Err(e) => {
                error!("Job {}: submission failed: {}", id, e);
                if any_accepted(&root) {
                    self.settle_partial(&mut root);
                } else {
                    self.roll_back(&mut root, opts.keep_on_fail);
                }
                Err(e)
            }
        }
    }

    /// Splits, creates workspaces, validates outputs and builds payloads
    fn prepare_submission(
        &self,
        root: &mut Job,
    ) -> Result<(CredentialRequirement, Vec<SubmissionTarget>), JobError> {
        let subjobs = self.splitter.split(root)?;
        if !subjobs.is_empty() {
            info!("Job {} split into {} subjob(s)", root.fqid(), subjobs.len());
            root.subjobs = subjobs;
        }

        let workspace = &self.ctx.workspace;
        workspace
            .create(root.job_ref())
            .map_err(|e| JobError::from_write(e, "workspace"))?;
        for target in root.targets() {
            workspace
                .create(target)
                .map_err(|e| JobError::from_write(e, "workspace"))?;
        }

        let targets = root.targets();
        self.build_targets(root, &targets)
    }

    fn build_targets(
        &self,
        root: &Job,
        targets: &[JobRef],
    ) -> Result<(CredentialRequirement, Vec<SubmissionTarget>), JobError> {
        for file in &root.output_files {
            file.validate()
                .map_err(|reason| JobError::Validation(format!("job {}: {}", root.fqid(), reason)))?;
        }

        let master = self.runtime.master_prepare(root)?;
        let mut prepared = Vec::with_capacity(targets.len());
        for target in targets {
            let job = root
                .job(target.sub)
                .ok_or_else(|| JobError::NotFound(target.to_string()))?;
            prepared.push(SubmissionTarget {
                job: *target,
                payload: self.runtime.prepare(job, &master)?,
            });
        }
        Ok((root.backend.credential.clone(), prepared))
    }

    /// Returns a root job whose submission reached nobody to `new`, or `failed`
    fn roll_back(&self, root: &mut Job, keep_on_fail: bool) {
        let status = if keep_on_fail {
            JobStatus::Failed
        } else {
            JobStatus::New
        };
        for index in 0..root.subjobs.len() {
            if root.subjobs[index].status() == JobStatus::Submitting {
                if let Err(e) = self.ctx.machine.update_status(
                    root,
                    Some(index),
                    JobStatus::Failed,
                    UpdateOptions::local(),
                ) {
                    warn!("Job {}.{}: {}", root.id, index, e);
                }
            }
        }
        match self
            .ctx
            .machine
            .update_status(root, None, status, UpdateOptions::default())
        {
            Ok(_) => info!("Job {} rolled back to {}", root.fqid(), status),
            Err(e) => error!("Job {}: rollback to {} failed: {}", root.fqid(), status, e),
        }
    }

    /// Fails subjobs left in `submitting` and aggregates the master
    fn settle_partial(&self, root: &mut Job) {
        for index in 0..root.subjobs.len() {
            if root.subjobs[index].status() == JobStatus::Submitting {
                if let Err(e) = self.ctx.machine.update_status(
                    root,
                    Some(index),
                    JobStatus::Failed,
                    UpdateOptions::local(),
                ) {
                    warn!("Job {}.{}: {}", root.id, index, e);
                }
            }
        }
        if let Err(e) = self.ctx.machine.update_master_status(root) {
            error!("Job {}: {}", root.fqid(), e);
        }
    }

    /// Kills a submitted or running job and all of its unfinished subjobs
    pub async fn kill(&self, id: u64) -> Result<(), JobError> {
        let tree = self.ctx.registry.tree(id)?;
        let (requirement, ids) = {
            let root = tree.lock().unwrap();
            match root.status() {
                JobStatus::Submitted | JobStatus::Running => {}
                JobStatus::Completed | JobStatus::Failed => {
                    warn!("Job {} is already {}, nothing to kill", id, root.status());
                    return Ok(());
                }
                other => {
                    return Err(JobError::InvalidState(format!(
                        "cannot kill job {} while it is {}",
                        id, other
                    )));
                }
            }
            (root.backend.credential.clone(), active_remote_ids(&root))
        };

        if !ids.is_empty() {
            info!("Killing {} remote job(s) of job {}", ids.len(), id);
            let _: serde_json::Value = self
                .ctx
                .remote(&requirement, RemoteCommand::Kill { ids })
                .await?;
        }

        let mut root = tree.lock().unwrap();
        // Subjobs parked in `completing` would never be finalised under a killed master
        for index in 0..root.subjobs.len() {
            let status = root.subjobs[index].status();
            if status.is_active() || status == JobStatus::Completing {
                self.ctx.machine.update_status(
                    &mut root,
                    Some(index),
                    JobStatus::Killed,
                    UpdateOptions::local(),
                )?;
            }
        }
        if root.status().is_active() {
            self.ctx
                .machine
                .update_status(&mut root, None, JobStatus::Killed, UpdateOptions::default())?;
        } else {
            info!("Job {} became {} while being killed", id, root.status());
        }
        Ok(())
    }

    /// Removes a root job, its workspace and its remote artifacts
    ///
    /// Active jobs are killed first unless `force` is set.
    pub async fn remove(&self, job: JobRef, force: bool) -> Result<(), JobError> {
        if job.sub.is_some() {
            return Err(JobError::InvalidState(format!(
                "subjob {} cannot be removed on its own",
                job
            )));
        }
        let id = job.root;
        let tree = self.ctx.registry.tree(id)?;

        let status = tree.lock().unwrap().status();
        match status {
            JobStatus::Removed => {
                return Err(JobError::InvalidState(format!("job {} is already removed", id)));
            }
            JobStatus::Completing => {
                return Err(JobError::InvalidState(format!(
                    "job {} is completing and cannot be removed",
                    id
                )));
            }
            s if s.is_active() && !force => self.kill(id).await?,
            _ => {}
        }

        let (requirement, ids) = {
            let root = tree.lock().unwrap();
            let ids: Vec<i64> = root
                .targets()
                .iter()
                .filter_map(|t| root.job(t.sub).and_then(|j| j.backend_state.remote_id))
                .collect();
            (root.backend.credential.clone(), ids)
        };
        if !ids.is_empty() {
            let released: Result<serde_json::Value, JobError> = self
                .ctx
                .remote(&requirement, RemoteCommand::Remove { ids })
                .await;
            if let Err(e) = released {
                warn!("Job {}: remote artifacts not released: {}", id, e);
            }
        }

        {
            let mut root = tree.lock().unwrap();
            if !self
                .ctx
                .machine
                .graph()
                .is_allowed(root.status(), JobStatus::Removed)
            {
                self.ctx.machine.update_status(
                    &mut root,
                    None,
                    JobStatus::Unknown,
                    UpdateOptions::default(),
                )?;
            }
            self.ctx
                .machine
                .update_status(&mut root, None, JobStatus::Removed, UpdateOptions::default())?;
        }

        self.ctx.workspace.release(job, false)?;
        self.ctx.registry.remove(id);
        info!("Removed job {}", id);
        Ok(())
    }

    /// Resubmits a finished job, optionally with changed backend settings
    pub async fn resubmit(
        &self,
        id: u64,
        backend: Option<BackendConfig>,
    ) -> Result<SubmissionReport, JobError> {
        self.resubmit_scoped(id, backend, ResubmitScope::Requested).await
    }

    /// Resubmits failed subjobs that have not hit the resubmission ceiling
    pub async fn auto_resubmit(&self, id: u64) -> Result<SubmissionReport, JobError> {
        self.resubmit_scoped(id, None, ResubmitScope::Automatic).await
    }

    async fn resubmit_scoped(
        &self,
        id: u64,
        backend: Option<BackendConfig>,
        scope: ResubmitScope,
    ) -> Result<SubmissionReport, JobError> {
        let tree = self.ctx.registry.tree(id)?;
        let (saved, backends, requirement, targets) = {
            let mut root = tree.lock().unwrap();
            let previous = root.status();
            match scope {
                ResubmitScope::Requested => {
                    if !matches!(
                        previous,
                        JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
                    ) {
                        return Err(JobError::InvalidState(format!(
                            "job {} is {}, only completed, failed or killed jobs can be resubmitted",
                            id, previous
                        )));
                    }
                }
                ResubmitScope::Automatic => {
                    if matches!(
                        previous,
                        JobStatus::New
                            | JobStatus::Template
                            | JobStatus::Submitting
                            | JobStatus::Removed
                    ) {
                        return Err(JobError::InvalidState(format!(
                            "job {} is {} and cannot be auto-resubmitted",
                            id, previous
                        )));
                    }
                }
            }

            let backends = match backend {
                Some(backend) => {
                    let before = backends_of(&root);
                    apply_backend_change(&mut root, backend)?;
                    Some(before)
                }
                None => None,
            };

            let selected = self.select_for_resubmit(&root, scope);
            if selected.is_empty() {
                info!("Job {}: nothing to resubmit", id);
                return Ok(SubmissionReport::default());
            }

            let mut saved: Saved = vec![(root.job_ref(), previous)];
            saved.extend(
                selected
                    .iter()
                    .filter(|t| t.sub.is_some())
                    .filter_map(|t| root.job(t.sub).map(|j| (*t, j.status()))),
            );

            match self.prepare_resubmission(&mut root, &selected) {
                Ok((requirement, targets)) => (saved, backends, requirement, targets),
                Err(e) => {
                    error!("Job {}: resubmission not prepared: {}", id, e);
                    self.ctx.machine.revert_status(&mut root, previous);
                    if let Some(before) = &backends {
                        restore_backends(&mut root, before);
                    }
                    return Err(e);
                }
            }
        };

        info!("Resubmitting {} target(s) of job {}", targets.len(), id);
        let result = self.submission.submit(&requirement, targets, false).await;

        let mut root = tree.lock().unwrap();
        match result {
            Ok(report) => {
                if !root.subjobs.is_empty() {
                    root.info.increment();
                    self.ctx.machine.update_master_status(&mut root)?;
                }
                Ok(report)
            }
            Err(e) => {
                error!("Job {}: resubmission failed: {}", id, e);
                // Accepted subjobs keep the backend they were submitted with
                if root.subjobs.is_empty() || !any_accepted(&root) {
                    revert(&self.ctx, &mut root, &saved);
                    if let Some(before) = &backends {
                        restore_backends(&mut root, before);
                    }
                } else {
                    self.settle_partial(&mut root);
                }
                Err(e)
            }
        }
    }

    fn select_for_resubmit(&self, root: &Job, scope: ResubmitScope) -> Vec<JobRef> {
        let ceiling = self.ctx.config.max_resubmits;
        let candidates: Vec<&Job> = if root.subjobs.is_empty() {
            vec![root]
        } else {
            root.subjobs.iter().collect()
        };

        match scope {
            ResubmitScope::Automatic => candidates
                .into_iter()
                .filter(|j| j.status() == JobStatus::Failed && j.info.submit_counter <= ceiling)
                .map(Job::job_ref)
                .collect(),
            ResubmitScope::Requested => {
                let finished: Vec<&Job> = candidates
                    .into_iter()
                    .filter(|j| j.status().is_final())
                    .collect();
                if self.ctx.config.resubmit_only_failed {
                    let unsuccessful: Vec<JobRef> = finished
                        .iter()
                        .filter(|j| matches!(j.status(), JobStatus::Failed | JobStatus::Killed))
                        .map(|j| j.job_ref())
                        .collect();
                    if !unsuccessful.is_empty() {
                        return unsuccessful;
                    }
                }
                finished.into_iter().map(Job::job_ref).collect()
            }
        }
    }

    /// Resets the selected targets and moves the root back to `submitting`
    fn prepare_resubmission(
        &self,
        root: &mut Job,
        selected: &[JobRef],
    ) -> Result<(CredentialRequirement, Vec<SubmissionTarget>), JobError> {
        self.ctx.machine.update_status(
            root,
            None,
            JobStatus::Submitting,
            UpdateOptions::local(),
        )?;

        for target in selected {
            self.ctx
                .workspace
                .clear_output(*target)
                .map_err(|e| JobError::from_write(e, "output workspace"))?;
            if let Some(job) = root.job_mut(target.sub) {
                job.backend_state.reset();
                job.been_queued = false;
                job.output_files = job.output_files.iter().map(|f| f.declaration()).collect();
            }
        }

        self.build_targets(root, selected)
    }

    /// Forces a job into `completed` or `failed`
    pub fn force_status(&self, job: JobRef, status: JobStatus) -> Result<JobStatus, JobError> {
        let forced = self
            .ctx
            .registry
            .with_root(job, |root| self.ctx.machine.force_status(root, job.sub, status))??;
        Ok(forced)
    }

    /// Queues bulk finalization of jobs stuck in `completing`
    pub fn finalise_completing_jobs(&self) -> Vec<TaskHandle<()>> {
        let stuck = self
            .ctx
            .registry
            .find_targets(|job| job.status() == JobStatus::Completing && !job.been_queued);
        if !stuck.is_empty() {
            info!("Recovering {} job(s) stuck in completing", stuck.len());
        }
        self.finaliser.finalise_jobs(stuck)
    }
}

/// Validates and applies a backend change requested at resubmission
fn apply_backend_change(root: &mut Job, backend: BackendConfig) -> Result<(), JobError> {
    if backend.kind != root.backend.kind {
        return Err(JobError::Validation(format!(
            "backend of job {} cannot change from '{}' to '{}'",
            root.fqid(),
            root.backend.kind,
            backend.kind
        )));
    }
    let encode = |config: &BackendConfig| {
        serde_json::to_value(config).map_err(|e| JobError::Validation(e.to_string()))
    };
    check_changes(
        BackendConfig::resubmit_rules(),
        &encode(&root.backend)?,
        &encode(&backend)?,
    )?;

    for sj in root.subjobs.iter_mut() {
        sj.backend = backend.clone();
    }
    root.backend = backend;
    Ok(())
}

/// Backend configurations of the root followed by its subjobs
fn backends_of(root: &Job) -> Vec<BackendConfig> {
    std::iter::once(&root.backend)
        .chain(root.subjobs.iter().map(|sj| &sj.backend))
        .cloned()
        .collect()
}

fn restore_backends(root: &mut Job, saved: &[BackendConfig]) {
    let mut saved = saved.iter().cloned();
    if let Some(backend) = saved.next() {
        root.backend = backend;
    }
    for (sj, backend) in root.subjobs.iter_mut().zip(saved) {
        sj.backend = backend;
    }
}

/// Remote ids of the targets still running remotely
fn active_remote_ids(root: &Job) -> Vec<i64> {
    root.targets()
        .iter()
        .filter_map(|t| root.job(t.sub))
        .filter(|j| j.status().is_active())
        .filter_map(|j| j.backend_state.remote_id)
        .collect()
}

/// True if any target of `root` was accepted by the remote service
fn any_accepted(root: &Job) -> bool {
    root.targets()
        .iter()
        .filter_map(|t| root.job(t.sub))
        .any(|j| j.status() == JobStatus::Submitted)
}

/// Restores the statuses saved before a resubmission
fn revert(ctx: &ManagerContext, root: &mut Job, saved: &Saved) {
    for (job, status) in saved {
        if let Some(target) = root.job_mut(job.sub) {
            if matches!(target.status(), JobStatus::Submitting | JobStatus::Failed) {
                ctx.machine.revert_status(target, *status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGateway, context, ok, spec, status_of};
    use gantry_core::domain::job::SplitterSpec;
    use gantry_gateway::GatewayReply;
    use serde_json::{Value, json};

    /// Accepts every batch entry except the listed keys; kill and remove succeed
    fn gateway(rejected: &'static [&'static str]) -> Arc<ScriptedGateway> {
        ScriptedGateway::new(move |cmd| match cmd {
            RemoteCommand::SubmitBatch { entries } => {
                let mut reply = serde_json::Map::new();
                for (i, entry) in entries.iter().enumerate() {
                    let value = if rejected.contains(&entry.key.as_str()) {
                        json!("no matching site")
                    } else {
                        json!(500 + i as i64)
                    };
                    reply.insert(entry.key.clone(), value);
                }
                ok(Value::Object(reply))
            }
            RemoteCommand::Kill { .. } | RemoteCommand::Remove { .. } => ok(json!({})),
            _ => GatewayReply::Failed("unexpected".into()),
        })
    }

    fn split_spec(name: &str, count: usize) -> JobSpec {
        let mut s = spec(name);
        s.splitter = Some(SplitterSpec::Replicate { count });
        s
    }

    fn set_status(manager: &JobManager, job: JobRef, status: JobStatus) {
        let ctx = manager.context();
        ctx.registry
            .with_root(job, |root| {
                ctx.machine
                    .update_status(root, job.sub, status, UpdateOptions::default())
            })
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_unsplit_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(spec("single"));

        let report = manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        assert_eq!(report.submitted, vec![job]);
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Submitted);
        assert_eq!(snapshot.remote_id, Some(500));
        assert_eq!(snapshot.submit_counter, 1);
        assert!(dir.path().join(job.root.to_string()).join("input").is_dir());
    }

    #[tokio::test]
    async fn test_submit_split_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(split_spec("split", 3));

        let report = manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        assert_eq!(report.submitted.len(), 3);
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Submitted);
        assert_eq!(snapshot.subjobs.len(), 3);
        assert!(snapshot.subjobs.iter().all(|sj| sj.status == JobStatus::Submitted));
        assert!(snapshot.subjobs.iter().all(|sj| sj.submit_counter == 1));
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back_to_new() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&["0.0", "0.1"])));
        let job = manager.create_job(split_spec("doomed", 2));

        let err = manager
            .submit(job.root, SubmitOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::IncompleteSubmission { .. }));
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::New);
        assert!(snapshot.subjobs.is_empty());
        let job_dir = dir.path().join(job.root.to_string());
        assert!(job_dir.is_dir());
        assert_eq!(std::fs::read_dir(&job_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_keep_on_fail_leaves_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&["0.0", "0.1"])));
        let job = manager.create_job(split_spec("doomed", 2));

        let opts = SubmitOptions {
            keep_on_fail: true,
            ..SubmitOptions::default()
        };
        assert!(manager.submit(job.root, opts).await.is_err());

        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.subjobs.len(), 2);
        assert!(dir.path().join("0").join("0").join("input").is_dir());
    }

    #[tokio::test]
    async fn test_partial_rejection_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&["0.1"])));
        let job = manager.create_job(split_spec("partial", 3));

        let report = manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        assert_eq!(report.submitted.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(status_of(manager.context(), JobRef::subjob(job.root, 1)), JobStatus::Failed);
        assert_eq!(status_of(manager.context(), job), JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_template_cannot_be_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let mut s = spec("template");
        s.template = true;
        let job = manager.create_job(s);

        let err = manager
            .submit(job.root, SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
        assert_eq!(status_of(manager.context(), job), JobStatus::Template);
    }

    #[tokio::test]
    async fn test_kill_split_job() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(split_spec("kill", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        manager.kill(job.root).await.unwrap();

        assert_eq!(gw.count("kill"), 1);
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Killed);
        assert!(snapshot.subjobs.iter().all(|sj| sj.status == JobStatus::Killed));
    }

    #[tokio::test]
    async fn test_kill_releases_subjobs_parked_for_master() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let mut s = split_spec("parked", 2);
        s.backend.finalise_on_master = true;
        let job = manager.create_job(s);
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        let first = JobRef::subjob(job.root, 0);
        manager
            .finaliser
            .job_finalisation(first, JobStatus::Completed)
            .await
            .unwrap();
        assert_eq!(status_of(manager.context(), first), JobStatus::Completing);

        manager.kill(job.root).await.unwrap();
        for handle in manager.finalise_completing_jobs() {
            handle.join().await.unwrap();
        }

        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Killed);
        assert!(snapshot.subjobs.iter().all(|sj| sj.status == JobStatus::Killed));
        assert!(manager.context().registry.is_settled());
    }

    #[tokio::test]
    async fn test_kill_finished_job_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(spec("done"));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, job, JobStatus::Failed);

        manager.kill(job.root).await.unwrap();
        assert_eq!(gw.count("kill"), 0);

        let fresh = manager.create_job(spec("fresh"));
        assert!(matches!(
            manager.kill(fresh.root).await,
            Err(JobError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(spec("remove"));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        manager.remove(job, false).await.unwrap();

        assert_eq!(gw.count("kill"), 1);
        assert_eq!(gw.count("remove"), 1);
        assert!(manager.snapshot(job.root).is_none());
        assert!(!dir.path().join(job.root.to_string()).exists());
    }

    #[tokio::test]
    async fn test_forced_remove_skips_kill() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(spec("forced"));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        manager.remove(job, true).await.unwrap();

        assert_eq!(gw.count("kill"), 0);
        assert!(manager.snapshot(job.root).is_none());
    }

    #[tokio::test]
    async fn test_remove_rejects_subjobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(split_spec("parent", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        let err = manager.remove(JobRef::subjob(job.root, 0), false).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_resubmit_only_failed_subjobs() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(split_spec("retry", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, JobRef::subjob(job.root, 0), JobStatus::Completed);
        set_status(&manager, JobRef::subjob(job.root, 1), JobStatus::Failed);
        assert_eq!(status_of(manager.context(), job), JobStatus::Failed);

        let report = manager.resubmit(job.root, None).await.unwrap();

        assert_eq!(report.submitted, vec![JobRef::subjob(job.root, 1)]);
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Submitted);
        assert_eq!(snapshot.subjobs[0].status, JobStatus::Completed);
        assert_eq!(snapshot.subjobs[1].status, JobStatus::Submitted);
        assert_eq!(snapshot.subjobs[1].submit_counter, 2);
        assert_eq!(gw.count("submit_batch"), 2);
    }

    #[tokio::test]
    async fn test_resubmit_rejects_backend_kind_change() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(spec("kind"));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, job, JobStatus::Failed);

        let tree = manager.context().registry.tree(job.root).unwrap();
        let mut backend = tree.lock().unwrap().backend.clone();
        backend.kind = "batch".to_string();

        let err = manager.resubmit(job.root, Some(backend)).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(status_of(manager.context(), job), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_resubmit_requires_finished_job() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(&[]);
        let manager = JobManager::new(context(dir.path(), gw.clone()));
        let job = manager.create_job(spec("fresh"));

        let err = manager.resubmit(job.root, None).await.unwrap_err();

        assert!(matches!(err, JobError::InvalidState(_)));
        assert_eq!(status_of(manager.context(), job), JobStatus::New);
        assert_eq!(gw.count("submit_batch"), 0);
    }

    #[tokio::test]
    async fn test_resubmit_timeout_restores_previous_status() {
        let dir = tempfile::tempdir().unwrap();
        let gw = ScriptedGateway::new(|cmd| match cmd {
            RemoteCommand::SubmitBatch { entries } if entries.len() == 2 => {
                ok(json!({"0.0": 10, "0.1": 11}))
            }
            RemoteCommand::SubmitBatch { .. } => GatewayReply::TimedOut,
            _ => GatewayReply::Failed("unexpected".into()),
        });
        let manager = JobManager::new(context(dir.path(), gw));
        let job = manager.create_job(split_spec("timeout", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, JobRef::subjob(job.root, 0), JobStatus::Completed);
        set_status(&manager, JobRef::subjob(job.root, 1), JobStatus::Failed);

        let err = manager.resubmit(job.root, None).await.unwrap_err();

        assert!(matches!(err, JobError::Backend(_)));
        let snapshot = manager.snapshot(job.root).unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.subjobs[0].status, JobStatus::Completed);
        assert_eq!(snapshot.subjobs[1].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_resubmit_restores_backend() {
        let dir = tempfile::tempdir().unwrap();
        let batches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&batches);
        let gw = ScriptedGateway::new(move |cmd| match cmd {
            RemoteCommand::SubmitBatch { .. } => {
                if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    ok(json!({"0.0": 10, "0.1": 11}))
                } else {
                    GatewayReply::TimedOut
                }
            }
            _ => GatewayReply::Failed("unexpected".into()),
        });
        let manager = JobManager::new(context(dir.path(), gw));
        let job = manager.create_job(split_spec("site", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, JobRef::subjob(job.root, 0), JobStatus::Failed);
        set_status(&manager, JobRef::subjob(job.root, 1), JobStatus::Failed);

        let tree = manager.context().registry.tree(job.root).unwrap();
        let original = tree.lock().unwrap().backend.clone();
        let moved = original.clone().with_setting("site", json!("LCG.CERN.cern"));

        let err = manager.resubmit(job.root, Some(moved)).await.unwrap_err();

        assert!(matches!(err, JobError::Backend(_)));
        assert_eq!(batches.load(std::sync::atomic::Ordering::SeqCst), 2);
        let root = tree.lock().unwrap();
        assert_eq!(root.status(), JobStatus::Failed);
        assert_eq!(root.backend, original);
        assert!(root.subjobs.iter().all(|sj| sj.backend == original));
    }

    #[tokio::test]
    async fn test_auto_resubmit_respects_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(split_spec("auto", 3));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();
        set_status(&manager, JobRef::subjob(job.root, 0), JobStatus::Failed);
        set_status(&manager, JobRef::subjob(job.root, 1), JobStatus::Failed);
        manager
            .context()
            .registry
            .with_root(JobRef::subjob(job.root, 1), |root| {
                root.subjobs[1].info.submit_counter = 4;
            })
            .unwrap();

        let report = manager.auto_resubmit(job.root).await.unwrap();

        assert_eq!(report.submitted, vec![JobRef::subjob(job.root, 0)]);
        assert_eq!(status_of(manager.context(), JobRef::subjob(job.root, 1)), JobStatus::Failed);
        assert_eq!(status_of(manager.context(), job), JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_force_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(context(dir.path(), gateway(&[])));
        let job = manager.create_job(split_spec("force", 2));
        manager.submit(job.root, SubmitOptions::default()).await.unwrap();

        assert_eq!(manager.force_status(job, JobStatus::Failed).unwrap(), JobStatus::Failed);
        let snapshot = manager.snapshot(job.root).unwrap();
        assert!(snapshot.subjobs.iter().all(|sj| sj.status == JobStatus::Failed));
        assert!(manager.force_status(job, JobStatus::Completed).is_err());
    }
}
