//! Job registry
//!
//! Owns every root job. Each root job and its subjobs form one tree behind a
//! single mutex; that lock is the exclusive lock for every status change in
//! the tree. Subjobs are addressed by `JobRef { root, sub }`.

use gantry_core::domain::backend::CredentialRequirement;
use gantry_core::dto::job::{JobSnapshot, JobSpec};
use gantry_core::{Job, JobRef, JobStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::JobError;

pub type JobTree = Arc<Mutex<Job>>;

/// A job the monitoring loop may need to look at
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedJob {
    pub job: JobRef,
    pub status: JobStatus,
    pub remote_id: Option<i64>,
    pub remote_status: Option<String>,
    pub credential: CredentialRequirement,
}

pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<BTreeMap<u64, JobTree>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            jobs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a job in `new` (or `template`) and returns its address
    pub fn create(&self, spec: JobSpec) -> JobRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(id, spec);
        self.jobs
            .write()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(job)));
        JobRef::root(id)
    }

    pub fn get(&self, id: u64) -> Option<JobTree> {
        self.jobs.read().unwrap().get(&id).cloned()
    }

    /// The tree holding `id`, or `NotFound`
    pub fn tree(&self, id: u64) -> Result<JobTree, JobError> {
        self.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Drops a root job from the registry
    pub fn remove(&self, id: u64) -> Option<JobTree> {
        self.jobs.write().unwrap().remove(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.jobs.read().unwrap().keys().copied().collect()
    }

    fn trees(&self) -> Vec<JobTree> {
        self.jobs.read().unwrap().values().cloned().collect()
    }

    /// Runs `f` with the root of `job`'s tree locked
    pub fn with_root<R>(&self, job: JobRef, f: impl FnOnce(&mut Job) -> R) -> Result<R, JobError> {
        let tree = self.tree(job.root)?;
        let mut root = tree.lock().unwrap();
        if let Some(index) = job.sub {
            if index >= root.subjobs.len() {
                return Err(JobError::NotFound(job.to_string()));
            }
        }
        Ok(f(&mut root))
    }

    pub fn status(&self, job: JobRef) -> Result<JobStatus, JobError> {
        self.with_root(job, |root| root.job(job.sub).map(Job::status))?
            .ok_or_else(|| JobError::NotFound(job.to_string()))
    }

    pub fn snapshot(&self, id: u64) -> Option<JobSnapshot> {
        self.get(id)
            .map(|tree| JobSnapshot::from(&*tree.lock().unwrap()))
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.trees()
            .iter()
            .map(|tree| JobSnapshot::from(&*tree.lock().unwrap()))
            .collect()
    }

    /// Submitted or running backend targets not already queued for finalization
    pub fn tracked_jobs(&self) -> Vec<TrackedJob> {
        let mut tracked = Vec::new();
        for tree in self.trees() {
            let root = tree.lock().unwrap();
            let candidates: Vec<&Job> = if root.subjobs.is_empty() {
                vec![&*root]
            } else {
                root.subjobs.iter().collect()
            };
            for job in candidates {
                if job.status().is_active() && !job.been_queued {
                    tracked.push(TrackedJob {
                        job: job.job_ref(),
                        status: job.status(),
                        remote_id: job.backend_state.remote_id,
                        remote_status: job.backend_state.remote_status.clone(),
                        credential: job.backend.credential.clone(),
                    });
                }
            }
        }
        tracked
    }

    /// Backend targets matching `filter`
    pub fn find_targets(&self, filter: impl Fn(&Job) -> bool) -> Vec<JobRef> {
        let mut found = Vec::new();
        for tree in self.trees() {
            let root = tree.lock().unwrap();
            if root.subjobs.is_empty() {
                if filter(&root) {
                    found.push(root.job_ref());
                }
            } else {
                found.extend(root.subjobs.iter().filter(|sj| filter(sj)).map(Job::job_ref));
            }
        }
        found
    }

    /// True when no job has remote work outstanding
    pub fn is_settled(&self) -> bool {
        self.trees().iter().all(|tree| {
            let root = tree.lock().unwrap();
            let busy = |job: &Job| {
                matches!(
                    job.status(),
                    JobStatus::Submitting
                        | JobStatus::Submitted
                        | JobStatus::Running
                        | JobStatus::Completing
                ) || job.been_queued
            };
            !busy(&root) && !root.subjobs.iter().any(busy)
        })
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spec;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = JobRegistry::new();
        let a = registry.create(spec("a"));
        let b = registry.create(spec("b"));
        assert_eq!(a, JobRef::root(0));
        assert_eq!(b, JobRef::root(1));

        registry.remove(0);
        let c = registry.create(spec("c"));
        assert_eq!(c, JobRef::root(2));
        assert_eq!(registry.ids(), vec![1, 2]);
    }

    #[test]
    fn test_with_root_rejects_unknown_subjob() {
        let registry = JobRegistry::new();
        let job = registry.create(spec("a"));
        assert!(registry.with_root(JobRef::subjob(job.root, 0), |_| ()).is_err());
        assert!(registry.with_root(JobRef::root(99), |_| ()).is_err());
        assert_eq!(registry.status(job).unwrap(), JobStatus::New);
    }

    #[test]
    fn test_new_jobs_are_not_tracked_and_registry_is_settled() {
        let registry = JobRegistry::new();
        registry.create(spec("a"));
        assert!(registry.tracked_jobs().is_empty());
        assert!(registry.is_settled());
        assert_eq!(registry.snapshots().len(), 1);
        assert_eq!(registry.snapshot(0).unwrap().status, JobStatus::New);
    }
}
