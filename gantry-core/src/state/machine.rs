//! Status transitions
//!
//! `StateMachine` is the only code that writes `Job::status`. A transition
//! looks up the edge, runs its hook, runs post-processing and output
//! validation, records the timestamp and commits. Any failure restores the
//! job to the status and timestamps it had before the call.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::job::Job;
use crate::domain::status::JobStatus;
use crate::error::{GraphError, HookSignal, JobStatusError};
use crate::state::graph::{Hook, TransitionGraph};

/// Master status is the first of these found among its subjobs
pub const AGGREGATION_PRIORITY: [JobStatus; 7] = [
    JobStatus::Submitting,
    JobStatus::Submitted,
    JobStatus::Running,
    JobStatus::Completing,
    JobStatus::Failed,
    JobStatus::Killed,
    JobStatus::Completed,
];

/// Callbacks run by the state machine while a transition is in progress
///
/// Implementations run with the job's tree lock held and must not block on
/// remote calls.
pub trait TransitionHooks: Send + Sync {
    /// Runs `hook` for `job`
    ///
    /// Returning `HookSignal::Override` commits a different status instead.
    fn run(&self, hook: Hook, job: &mut Job) -> Result<(), HookSignal>;

    /// Post-processing for a transition into `new`
    ///
    /// `Ok(false)` fails the job.
    fn transition_update(&self, _job: &mut Job, _new: JobStatus) -> Result<bool, HookSignal> {
        Ok(true)
    }
}

/// Hooks that do nothing
pub struct NoopHooks;

impl TransitionHooks for NoopHooks {
    fn run(&self, _hook: Hook, _job: &mut Job) -> Result<(), HookSignal> {
        Ok(())
    }
}

/// Flags of a single `update_status` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Run post-processing and output validation
    pub transition_update: bool,
    /// Recompute the master status afterwards
    pub update_master: bool,
    /// Accept `completed` even when output validation fails
    pub ignore_failures: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            transition_update: true,
            update_master: true,
            ignore_failures: false,
        }
    }
}

impl UpdateOptions {
    /// Default options without master propagation, for batched updates
    pub fn local() -> Self {
        Self {
            update_master: false,
            ..Self::default()
        }
    }

    pub fn ignoring_failures(mut self) -> Self {
        self.ignore_failures = true;
        self
    }
}

/// Applies status transitions to jobs
pub struct StateMachine {
    graph: TransitionGraph,
    hooks: Arc<dyn TransitionHooks>,
    fail_if_no_output_matched: bool,
}

impl StateMachine {
    /// Creates a state machine over the standard transition graph
    pub fn new(hooks: Arc<dyn TransitionHooks>) -> Result<Self, GraphError> {
        Self::with_graph(TransitionGraph::standard(), hooks)
    }

    /// Creates a state machine over `graph` after validating it
    pub fn with_graph(
        graph: TransitionGraph,
        hooks: Arc<dyn TransitionHooks>,
    ) -> Result<Self, GraphError> {
        graph.validate()?;
        Ok(Self {
            graph,
            hooks,
            fail_if_no_output_matched: true,
        })
    }

    pub fn fail_if_no_output_matched(mut self, enabled: bool) -> Self {
        self.fail_if_no_output_matched = enabled;
        self
    }

    pub fn graph(&self) -> &TransitionGraph {
        &self.graph
    }

    /// Transitions the job at `sub` inside the tree rooted at `root`
    ///
    /// When the target is a subjob and `opts.update_master` is set, the
    /// master status is recomputed afterwards.
    pub fn update_status(
        &self,
        root: &mut Job,
        sub: Option<usize>,
        new: JobStatus,
        opts: UpdateOptions,
    ) -> Result<JobStatus, JobStatusError> {
        let Some(index) = sub else {
            return self.transition(root, new, opts);
        };

        let fqid = root.fqid();
        let job = root
            .subjobs
            .get_mut(index)
            .ok_or(JobStatusError::NoSuchSubjob { fqid, index })?;
        let status = self.transition(job, new, opts)?;

        if opts.update_master {
            self.update_master_status(root)?;
        }

        Ok(status)
    }

    /// Transitions a single job without touching its master
    pub fn transition(
        &self,
        job: &mut Job,
        new: JobStatus,
        opts: UpdateOptions,
    ) -> Result<JobStatus, JobStatusError> {
        let initial = job.status;
        if initial == new {
            return Ok(initial);
        }

        let saved_times = job.time.len();
        match self.apply(job, initial, new, opts, true) {
            Ok(status) => {
                debug!("Job {} status {} -> {}", job.fqid(), initial, status);
                Ok(status)
            }
            Err(e) => {
                job.status = initial;
                job.time.truncate(saved_times);
                error!("Job {}: {}", job.fqid(), e);
                Err(e)
            }
        }
    }

    fn apply(
        &self,
        job: &mut Job,
        initial: JobStatus,
        requested: JobStatus,
        opts: UpdateOptions,
        allow_redirect: bool,
    ) -> Result<JobStatus, JobStatusError> {
        let mut new = requested;
        let transition = self
            .graph
            .lookup(initial, new)
            .ok_or_else(|| JobStatusError::Forbidden {
                fqid: job.fqid(),
                from: initial,
                to: new,
            })?;

        if let Some(hook) = transition.hook {
            match self.hooks.run(hook, job) {
                Ok(()) => {}
                Err(HookSignal::Override(status)) => {
                    if !self.graph.is_allowed(initial, status) {
                        return Err(JobStatusError::Forbidden {
                            fqid: job.fqid(),
                            from: initial,
                            to: status,
                        });
                    }
                    info!(
                        "Job {}: {:?} hook changed target status from {} to {}",
                        job.fqid(),
                        hook,
                        new,
                        status
                    );
                    new = status;
                }
                Err(HookSignal::Failed(message)) => {
                    return Err(JobStatusError::Hook {
                        fqid: job.fqid(),
                        hook,
                        message,
                    });
                }
            }
        }

        if new == initial {
            return Ok(initial);
        }

        if opts.transition_update {
            let passed = match self.hooks.transition_update(job, new) {
                Ok(passed) => passed,
                Err(signal) => {
                    return Err(JobStatusError::Postprocess {
                        fqid: job.fqid(),
                        message: signal.to_string(),
                    });
                }
            };

            if !passed && new != JobStatus::Failed {
                if !allow_redirect || !self.graph.is_allowed(initial, JobStatus::Failed) {
                    return Err(JobStatusError::Postprocess {
                        fqid: job.fqid(),
                        message: format!("post-processing rejected status '{}'", new),
                    });
                }
                warn!("Job {}: post-processing failed, marking failed", job.fqid());
                return self.apply(job, initial, JobStatus::Failed, opts, false);
            }

            if new == JobStatus::Completed && !opts.ignore_failures && allow_redirect {
                let failures = job.output_failures(self.fail_if_no_output_matched);
                if !failures.is_empty() {
                    warn!(
                        "Job {}: output validation failed ({}), marking failed",
                        job.fqid(),
                        failures.join("; ")
                    );
                    return self.apply(job, initial, JobStatus::Failed, opts, false);
                }
            }
        }

        job.time.record(new.as_str());
        job.status = new;
        Ok(new)
    }

    /// Recomputes a master's status from its subjobs
    ///
    /// Returns the new status, or `None` when nothing changed.
    pub fn update_master_status(&self, master: &mut Job) -> Result<Option<JobStatus>, JobStatusError> {
        let present = master.subjob_statuses();
        let Some(target) = AGGREGATION_PRIORITY
            .iter()
            .copied()
            .find(|status| present.contains(status))
        else {
            debug!(
                "Job {}: no subjob in an aggregatable state, master status kept",
                master.fqid()
            );
            return Ok(None);
        };

        if target == master.status {
            return Ok(None);
        }

        let old = master.status;
        self.transition(master, target, UpdateOptions::default())?;
        info!("Master job {} status changed from {} to {}", master.fqid(), old, target);
        Ok(Some(target))
    }

    /// Pushes a job into `completed` or `failed` regardless of remote state
    ///
    /// Unfinished subjobs are forced first. Output validation is skipped.
    pub fn force_status(
        &self,
        root: &mut Job,
        sub: Option<usize>,
        status: JobStatus,
    ) -> Result<JobStatus, JobStatusError> {
        let allowed: &[JobStatus] = match status {
            JobStatus::Completed => &[JobStatus::Completing],
            JobStatus::Failed => &[
                JobStatus::Submitting,
                JobStatus::Completing,
                JobStatus::Submitted,
                JobStatus::Running,
                JobStatus::Killed,
            ],
            _ => &[],
        };

        let root_fqid = root.fqid();
        let job = root
            .job_mut(sub)
            .ok_or_else(|| JobStatusError::NoSuchSubjob {
                fqid: root_fqid,
                index: sub.unwrap_or_default(),
            })?;

        if job.status == status {
            return Ok(status);
        }

        if !allowed.contains(&job.status) {
            return Err(JobStatusError::ForceNotAllowed {
                fqid: job.fqid(),
                from: job.status,
                to: status,
            });
        }

        let opts = UpdateOptions::default().ignoring_failures();
        for sj in job.subjobs.iter_mut() {
            if allowed.contains(&sj.status) {
                self.transition(sj, status, opts)?;
            }
        }

        info!("Forcing job {} to {}", job.fqid(), status);
        self.update_status(root, sub, status, opts)
    }

    /// Restores a status saved before a multi-step operation that failed
    ///
    /// Bypasses the graph; only for undoing work this process started.
    pub fn revert_status(&self, job: &mut Job, status: JobStatus) {
        if job.status != status {
            warn!("Job {}: reverting status {} -> {}", job.fqid(), job.status, status);
            job.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{BackendConfig, CredentialRequirement};
    use crate::domain::files::OutputFile;
    use crate::domain::job::Application;
    use crate::dto::job::JobSpec;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records every hook run; optionally fails or overrides one of them
    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<Hook>>,
        fail_on: Option<Hook>,
        override_on: Option<(Hook, JobStatus)>,
        reject_postprocess: bool,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<Hook> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TransitionHooks for RecordingHooks {
        fn run(&self, hook: Hook, _job: &mut Job) -> Result<(), HookSignal> {
            self.calls.lock().unwrap().push(hook);
            if self.fail_on == Some(hook) {
                return Err(HookSignal::Failed("boom".to_string()));
            }
            if let Some((on, status)) = self.override_on {
                if on == hook {
                    return Err(HookSignal::Override(status));
                }
            }
            Ok(())
        }

        fn transition_update(&self, _job: &mut Job, new: JobStatus) -> Result<bool, HookSignal> {
            Ok(!(self.reject_postprocess && new == JobStatus::Completed))
        }
    }

    fn job(id: u64) -> Job {
        Job::new(
            id,
            JobSpec {
                name: "test".to_string(),
                application: Application {
                    executable: "echo".to_string(),
                    args: vec![],
                    env: BTreeMap::new(),
                },
                backend: BackendConfig::new("grid", CredentialRequirement::new("vo")),
                input_files: vec![],
                output_files: vec![],
                splitter: None,
                template: false,
            },
        )
    }

    fn job_in(status: JobStatus) -> Job {
        let mut job = job(1);
        job.status = status;
        job
    }

    fn master_with(statuses: &[JobStatus]) -> Job {
        let mut master = job(10);
        for (i, status) in statuses.iter().enumerate() {
            let mut sj = master.make_subjob(i, vec![]);
            sj.status = *status;
            master.subjobs.push(sj);
        }
        master
    }

    fn machine(hooks: Arc<RecordingHooks>) -> StateMachine {
        StateMachine::new(hooks).unwrap()
    }

    #[test]
    fn test_forbidden_transitions_leave_status_unchanged() {
        let sm = machine(Arc::new(RecordingHooks::default()));
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if sm.graph().is_allowed(from, to) {
                    continue;
                }
                let mut job = job_in(from);
                let times = job.time.len();
                let err = sm.transition(&mut job, to, UpdateOptions::default()).unwrap_err();
                assert!(err.is_forbidden(), "{} -> {}", from, to);
                assert_eq!(job.status(), from);
                assert_eq!(job.time.len(), times);
            }
        }
    }

    #[test]
    fn test_hook_failure_rolls_back() {
        let hooks = Arc::new(RecordingHooks {
            fail_on: Some(Hook::MonitorSubmitting),
            ..Default::default()
        });
        let sm = machine(hooks.clone());
        let mut job = job(1);
        let times = job.time.len();

        let err = sm
            .transition(&mut job, JobStatus::Submitting, UpdateOptions::default())
            .unwrap_err();

        assert!(matches!(err, JobStatusError::Hook { hook: Hook::MonitorSubmitting, .. }));
        assert_eq!(job.status(), JobStatus::New);
        assert_eq!(job.time.len(), times);
        assert_eq!(hooks.calls(), vec![Hook::MonitorSubmitting]);
    }

    #[test]
    fn test_self_transition_is_silent() {
        let hooks = Arc::new(RecordingHooks::default());
        let sm = machine(hooks.clone());
        let mut job = job_in(JobStatus::Running);
        let times = job.time.len();

        let status = sm
            .transition(&mut job, JobStatus::Running, UpdateOptions::default())
            .unwrap();

        assert_eq!(status, JobStatus::Running);
        assert!(hooks.calls().is_empty());
        assert_eq!(job.time.len(), times);
    }

    #[test]
    fn test_successful_transition_runs_hook_and_records_time() {
        let hooks = Arc::new(RecordingHooks::default());
        let sm = machine(hooks.clone());
        let mut job = job(1);

        sm.transition(&mut job, JobStatus::Submitting, UpdateOptions::default())
            .unwrap();
        sm.transition(&mut job, JobStatus::Submitted, UpdateOptions::default())
            .unwrap();

        assert_eq!(job.status(), JobStatus::Submitted);
        assert!(job.time.get("submitting").is_some());
        assert!(job.time.get("submitted").is_some());
        assert_eq!(
            hooks.calls(),
            vec![Hook::MonitorSubmitting, Hook::MonitorSubmitted]
        );
    }

    #[test]
    fn test_hook_override_changes_target() {
        let hooks = Arc::new(RecordingHooks {
            override_on: Some((Hook::Postprocess, JobStatus::Failed)),
            ..Default::default()
        });
        let sm = machine(hooks.clone());
        let mut job = job_in(JobStatus::Completing);

        let status = sm
            .transition(&mut job, JobStatus::Completed, UpdateOptions::default())
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.time.get("completed").is_none());
    }

    #[test]
    fn test_output_validation_redirects_once() {
        let hooks = Arc::new(RecordingHooks::default());
        let sm = machine(hooks.clone());
        let mut job = job_in(JobStatus::Completing);
        job.output_files.push(OutputFile::remote("*.root"));

        let status = sm
            .transition(&mut job, JobStatus::Completed, UpdateOptions::default())
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            hooks.calls(),
            vec![Hook::Postprocess, Hook::PostprocessFailed]
        );
    }

    #[test]
    fn test_ignore_failures_accepts_unmatched_output() {
        let sm = machine(Arc::new(RecordingHooks::default()));
        let mut job = job_in(JobStatus::Completing);
        job.output_files.push(OutputFile::remote("*.root"));

        let status = sm
            .transition(
                &mut job,
                JobStatus::Completed,
                UpdateOptions::default().ignoring_failures(),
            )
            .unwrap();
        assert_eq!(status, JobStatus::Completed);

        let sm = machine(Arc::new(RecordingHooks::default())).fail_if_no_output_matched(false);
        let mut job = job_in(JobStatus::Completing);
        job.output_files.push(OutputFile::remote("*.root"));
        assert_eq!(
            sm.transition(&mut job, JobStatus::Completed, UpdateOptions::default())
                .unwrap(),
            JobStatus::Completed
        );
    }

    #[test]
    fn test_rejected_postprocessing_fails_job() {
        let hooks = Arc::new(RecordingHooks {
            reject_postprocess: true,
            ..Default::default()
        });
        let sm = machine(hooks);
        let mut job = job_in(JobStatus::Running);

        let status = sm
            .transition(&mut job, JobStatus::Completed, UpdateOptions::default())
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn test_aggregation_priority() {
        let sm = machine(Arc::new(RecordingHooks::default()));

        let mut master = master_with(&[JobStatus::Completed, JobStatus::Running]);
        master.status = JobStatus::Submitted;
        assert_eq!(
            sm.update_master_status(&mut master).unwrap(),
            Some(JobStatus::Running)
        );

        let mut master = master_with(&[JobStatus::Completed, JobStatus::Failed]);
        master.status = JobStatus::Running;
        sm.update_master_status(&mut master).unwrap();
        assert_eq!(master.status(), JobStatus::Failed);

        let mut master = master_with(&[JobStatus::Completed, JobStatus::Completed]);
        master.status = JobStatus::Running;
        sm.update_master_status(&mut master).unwrap();
        assert_eq!(master.status(), JobStatus::Completed);
    }

    #[test]
    fn test_aggregation_noop_when_unchanged() {
        let hooks = Arc::new(RecordingHooks::default());
        let sm = machine(hooks.clone());
        let mut master = master_with(&[JobStatus::Running, JobStatus::Completed]);
        master.status = JobStatus::Running;
        let times = master.time.len();

        assert_eq!(sm.update_master_status(&mut master).unwrap(), None);
        assert_eq!(master.time.len(), times);
        assert!(hooks.calls().is_empty());
    }

    #[test]
    fn test_subjob_update_propagates_to_master() {
        let sm = machine(Arc::new(RecordingHooks::default()));
        let mut master = master_with(&[JobStatus::Running, JobStatus::Submitted]);
        master.status = JobStatus::Submitted;

        sm.update_status(&mut master, Some(1), JobStatus::Running, UpdateOptions::default())
            .unwrap();
        assert_eq!(master.status(), JobStatus::Running);

        sm.update_status(&mut master, Some(0), JobStatus::Killed, UpdateOptions::local())
            .unwrap();
        assert_eq!(master.subjobs[0].status(), JobStatus::Killed);
        assert_eq!(master.status(), JobStatus::Running);

        let err = sm
            .update_status(&mut master, Some(5), JobStatus::Running, UpdateOptions::default())
            .unwrap_err();
        assert!(matches!(err, JobStatusError::NoSuchSubjob { index: 5, .. }));
    }

    #[test]
    fn test_force_status() {
        let sm = machine(Arc::new(RecordingHooks::default()));

        let mut job = job_in(JobStatus::Running);
        sm.force_status(&mut job, None, JobStatus::Failed).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);

        let mut job = job_in(JobStatus::Running);
        assert!(sm.force_status(&mut job, None, JobStatus::Completed).is_err());
        assert_eq!(job.status(), JobStatus::Running);

        let mut job = job_in(JobStatus::Completing);
        job.output_files.push(OutputFile::remote("missing.root"));
        sm.force_status(&mut job, None, JobStatus::Completed).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);

        let mut job = job_in(JobStatus::New);
        assert!(sm.force_status(&mut job, None, JobStatus::Killed).is_err());
    }

    #[test]
    fn test_force_status_forces_subjobs_first() {
        let sm = machine(Arc::new(RecordingHooks::default()));
        let mut master = master_with(&[JobStatus::Running, JobStatus::Completed]);
        master.status = JobStatus::Running;

        sm.force_status(&mut master, None, JobStatus::Failed).unwrap();

        assert_eq!(master.subjobs[0].status(), JobStatus::Failed);
        assert_eq!(master.subjobs[1].status(), JobStatus::Completed);
        assert_eq!(master.status(), JobStatus::Failed);
    }

    #[test]
    fn test_revert_status() {
        let sm = machine(Arc::new(RecordingHooks::default()));
        let mut job = job_in(JobStatus::Submitting);
        sm.revert_status(&mut job, JobStatus::Completed);
        assert_eq!(job.status(), JobStatus::Completed);
    }
}
