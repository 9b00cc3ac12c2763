//! Transition hooks
//!
//! The side effects the state machine runs while a job changes status:
//! releasing the workspace when a submission is rolled back, and resolving
//! output files when a job completes.

use gantry_core::{Hook, HookSignal, Job, JobStatus, TransitionHooks};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::locations;
use crate::workspace::Workspace;

/// A check run before a job may become `completed`
pub trait Postprocessor: Send + Sync {
    /// `false` fails the job
    fn process(&self, job: &Job) -> bool;
}

impl<F> Postprocessor for F
where
    F: Fn(&Job) -> bool + Send + Sync,
{
    fn process(&self, job: &Job) -> bool {
        self(job)
    }
}

pub struct StandardHooks {
    workspace: Workspace,
    postprocessors: Vec<Arc<dyn Postprocessor>>,
}

impl StandardHooks {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            postprocessors: Vec::new(),
        }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    fn rollback(&self, job: &mut Job) -> Result<(), HookSignal> {
        self.workspace
            .release(job.job_ref(), true)
            .map_err(|e| HookSignal::Failed(format!("cannot release workspace: {}", e)))?;
        if !job.subjobs.is_empty() {
            info!("Job {}: dropping {} subjob(s)", job.fqid(), job.subjobs.len());
            job.subjobs.clear();
        }
        job.backend_state.reset();
        Ok(())
    }

    /// Resolves output declarations from the location log and the downloaded sandbox
    fn resolve_outputs(&self, job: &mut Job) -> Result<usize, JobError> {
        let job_ref = job.job_ref();
        let mut records = locations::read_records(&self.workspace.locations_log(job_ref))?;
        records.extend(locations::sandbox_records(
            &job.output_files,
            &self.workspace.output_dir(job_ref),
        )?);
        Ok(locations::apply_records(job, &records))
    }
}

impl TransitionHooks for StandardHooks {
    fn run(&self, hook: Hook, job: &mut Job) -> Result<(), HookSignal> {
        match hook {
            Hook::MonitorSubmitting => {
                debug!("Job {} is being submitted", job.fqid());
                Ok(())
            }
            Hook::MonitorSubmitted => {
                info!(
                    "Job {} submitted (remote id {:?})",
                    job.fqid(),
                    job.backend_state.remote_id
                );
                Ok(())
            }
            Hook::MonitorFailed => {
                info!("Job {} failed", job.fqid());
                Ok(())
            }
            Hook::MonitorKilled => {
                info!("Job {} killed", job.fqid());
                Ok(())
            }
            Hook::RollbackToNew => self.rollback(job),
            Hook::Postprocess => {
                // Outputs of split jobs live on their subjobs
                if !job.subjobs.is_empty() {
                    return Ok(());
                }
                match self.resolve_outputs(job) {
                    Ok(resolved) => {
                        debug!("Job {}: resolved {} output file(s)", job.fqid(), resolved);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Job {}: cannot resolve outputs: {}", job.fqid(), e);
                        Err(HookSignal::Override(JobStatus::Failed))
                    }
                }
            }
            Hook::PostprocessFailed => {
                if job.subjobs.is_empty() {
                    if let Err(e) = self.resolve_outputs(job) {
                        warn!("Job {}: cannot resolve outputs: {}", job.fqid(), e);
                    }
                }
                Ok(())
            }
        }
    }

    fn transition_update(&self, job: &mut Job, new: JobStatus) -> Result<bool, HookSignal> {
        if new != JobStatus::Completed {
            return Ok(true);
        }
        Ok(self.postprocessors.iter().all(|p| p.process(job)))
    }
}
