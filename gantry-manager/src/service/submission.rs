//! Submission engine
//!
//! Sends prepared targets to the remote service in batches. Each batch is a
//! single `submit_batch` command embedding every member, dispatched inline or
//! onto the worker pool. The engine owns the per-target outcome: accepted
//! targets become `submitted` with their remote id, rejected subjobs become
//! `failed`. An unsplit root job is left in `submitting` for the caller to
//! settle.

use gantry_core::domain::backend::CredentialRequirement;
use gantry_core::{JobRef, JobStatus, UpdateOptions};
use gantry_gateway::{BatchEntry, RemoteCommand, SubmitOutcome, SubmitReply};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ManagerContext;
use crate::error::JobError;
use crate::pool::{SUBMIT_PRIORITY, TaskHandle};

/// A job and the payload describing it to the backend
#[derive(Debug, Clone)]
pub struct SubmissionTarget {
    pub job: JobRef,
    pub payload: Value,
}

/// What happened to each target of a submission
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubmissionReport {
    pub submitted: Vec<JobRef>,
    /// Failure reason keyed by FQID
    pub failures: BTreeMap<String, String>,
}

impl SubmissionReport {
    fn merge(&mut self, other: BatchOutcome) {
        self.submitted.extend(other.submitted);
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    submitted: Vec<JobRef>,
    failures: BTreeMap<String, String>,
    error: Option<JobError>,
}

pub struct SubmissionEngine {
    ctx: Arc<ManagerContext>,
}

impl SubmissionEngine {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        Self { ctx }
    }

    /// Submits `targets`, which must all belong to the same root job
    ///
    /// Subjob targets are moved to `submitting` first; an unsplit root is
    /// expected to be there already. Fails with `IncompleteSubmission` when
    /// nothing was accepted and `keep_going` is off.
    pub async fn submit(
        &self,
        requirement: &CredentialRequirement,
        targets: Vec<SubmissionTarget>,
        keep_going: bool,
    ) -> Result<SubmissionReport, JobError> {
        let Some(first) = targets.first() else {
            return Ok(SubmissionReport::default());
        };
        let root_id = first.job.root;
        if let Some(stray) = targets.iter().find(|t| t.job.root != root_id) {
            return Err(JobError::Validation(format!(
                "target {} does not belong to job {}",
                stray.job, root_id
            )));
        }

        self.mark_submitting(root_id, &targets)?;

        let batch_size = self.ctx.config.max_subjobs_per_batch;
        let batches: Vec<Vec<SubmissionTarget>> =
            targets.chunks(batch_size).map(<[_]>::to_vec).collect();
        info!(
            "Submitting {} target(s) of job {} in {} batch(es)",
            targets.len(),
            root_id,
            batches.len()
        );

        let outcomes = if self.ctx.config.parallel_submit {
            self.dispatch_to_pool(root_id, requirement, batches).await?
        } else {
            let mut outcomes = Vec::new();
            for batch in batches {
                outcomes.push(submit_batch(&self.ctx, root_id, requirement, batch).await);
            }
            outcomes
        };

        let mut report = SubmissionReport::default();
        let mut first_error = None;
        for mut outcome in outcomes {
            if let Some(e) = outcome.error.take() {
                let fatal = matches!(e, JobError::Protocol(_)) || !keep_going;
                if fatal && first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("Job {}: batch failed, continuing: {}", root_id, e);
                }
            }
            report.merge(outcome);
        }

        info!(
            "Job {}: {} target(s) submitted, {} failed",
            root_id,
            report.submitted.len(),
            report.failures.len()
        );

        if let Some(e) = first_error {
            return Err(e);
        }
        if report.submitted.is_empty() && !keep_going {
            return Err(JobError::IncompleteSubmission {
                fqid: root_id.to_string(),
                failures: report.failures,
            });
        }
        Ok(report)
    }

    fn mark_submitting(&self, root_id: u64, targets: &[SubmissionTarget]) -> Result<(), JobError> {
        let tree = self.ctx.registry.tree(root_id)?;
        let mut root = tree.lock().unwrap();
        for target in targets.iter().filter(|t| t.job.sub.is_some()) {
            self.ctx.machine.update_status(
                &mut root,
                target.job.sub,
                JobStatus::Submitting,
                UpdateOptions::local(),
            )?;
        }
        Ok(())
    }

    /// Queues every batch, then waits for all of them
    ///
    /// The wait is a bounded poll so it stops on shutdown.
    async fn dispatch_to_pool(
        &self,
        root_id: u64,
        requirement: &CredentialRequirement,
        batches: Vec<Vec<SubmissionTarget>>,
    ) -> Result<Vec<BatchOutcome>, JobError> {
        let mut handles: Vec<(usize, TaskHandle<BatchOutcome>)> = Vec::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let requirement = requirement.clone();
            let handle = self.ctx.pool.add_function(
                format!("submit {} batch {}", root_id, index),
                SUBMIT_PRIORITY,
                async move { submit_batch(&ctx, root_id, &requirement, batch).await },
            );
            handles.push((index, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        while !handles.is_empty() {
            let mut pending = Vec::with_capacity(handles.len());
            for (index, mut handle) in handles {
                match handle.poll_result() {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => outcomes.push(BatchOutcome {
                        error: Some(e),
                        ..BatchOutcome::default()
                    }),
                    None => pending.push((index, handle)),
                }
            }
            handles = pending;
            if handles.is_empty() {
                break;
            }
            if self.ctx.shutdown.is_cancelled() {
                return Err(JobError::InvalidState(format!(
                    "shutdown while submitting job {}",
                    root_id
                )));
            }
            debug!("Job {}: waiting for {} batch(es)", root_id, handles.len());
            tokio::time::sleep(self.ctx.config.submit_poll_interval).await;
        }

        Ok(outcomes)
    }
}

/// Submits one batch and applies the per-target outcome
async fn submit_batch(
    ctx: &ManagerContext,
    root_id: u64,
    requirement: &CredentialRequirement,
    batch: Vec<SubmissionTarget>,
) -> BatchOutcome {
    let keys: Vec<JobRef> = batch.iter().map(|t| t.job).collect();
    let entries = batch
        .into_iter()
        .map(|t| BatchEntry {
            key: t.job.to_string(),
            payload: t.payload,
        })
        .collect();

    let reply: SubmitReply = match ctx
        .remote(requirement, RemoteCommand::SubmitBatch { entries })
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Job {}: batch submission failed: {}", root_id, e);
            let reason = e.to_string();
            let mut outcome = BatchOutcome::default();
            for job in keys {
                fail_target(ctx, job, &reason, &mut outcome);
            }
            outcome.error = Some(e);
            return outcome;
        }
    };

    let mut outcome = BatchOutcome::default();
    let mut missing = Vec::new();
    for job in keys {
        match reply.get(&job.to_string()) {
            Some(SubmitOutcome::Id(remote_id)) => accept_target(ctx, job, *remote_id, &mut outcome),
            Some(SubmitOutcome::Reason(reason)) => fail_target(ctx, job, reason, &mut outcome),
            Some(SubmitOutcome::Other(value)) => {
                fail_target(ctx, job, &format!("remote error: {}", value), &mut outcome)
            }
            None => {
                fail_target(ctx, job, "no result returned", &mut outcome);
                missing.push(job.to_string());
            }
        }
    }

    if !missing.is_empty() {
        outcome.error = Some(JobError::Protocol(format!(
            "submission reply for job {} is missing {}",
            root_id,
            missing.join(", ")
        )));
    }
    outcome
}

fn accept_target(ctx: &ManagerContext, job: JobRef, remote_id: i64, outcome: &mut BatchOutcome) {
    let result = ctx.registry.with_root(job, |root| {
        if let Some(target) = root.job_mut(job.sub) {
            target.backend_state.remote_id = Some(remote_id);
            target.info.increment();
        }
        ctx.machine
            .update_status(root, job.sub, JobStatus::Submitted, UpdateOptions::local())
    });

    match result {
        Ok(Ok(_)) => {
            debug!("Job {} accepted with remote id {}", job, remote_id);
            outcome.submitted.push(job);
        }
        Ok(Err(e)) => {
            outcome.failures.insert(job.to_string(), e.to_string());
        }
        Err(e) => {
            outcome.failures.insert(job.to_string(), e.to_string());
        }
    }
}

fn fail_target(ctx: &ManagerContext, job: JobRef, reason: &str, outcome: &mut BatchOutcome) {
    warn!("Job {} was not submitted: {}", job, reason);
    outcome.failures.insert(job.to_string(), reason.to_string());

    if job.sub.is_none() {
        return;
    }
    let result = ctx.registry.with_root(job, |root| {
        ctx.machine
            .update_status(root, job.sub, JobStatus::Failed, UpdateOptions::local())
    });
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Job {}: cannot mark failed: {}", job, e),
        Err(e) => warn!("Job {}: cannot mark failed: {}", job, e),
    }
}
