//! Monitoring
//!
//! One round queries the remote status of every tracked job in a single bulk
//! call per credential, applies the mapped local statuses, fetches backend
//! state-entry times once per observed state, and hands jobs the remote
//! service considers finished to the finalization engine.
//!
//! Master statuses are recomputed once per involved master at the end of the
//! round, after every subjob update is committed.

use gantry_core::domain::backend::CredentialRequirement;
use gantry_core::{JobRef, JobStatus, UpdateOptions};
use gantry_gateway::{RemoteCommand, StateTimesReply, StatusEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::ManagerContext;
use crate::pool::FINALISE_PRIORITY;
use crate::registry::TrackedJob;
use crate::service::finalisation::{FinaliseGate, FinalisationEngine, finalise_gate};

/// What one monitoring round did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoundSummary {
    pub polled: usize,
    pub updated: usize,
    pub queued: usize,
    /// Jobs failed because they never received a remote id
    pub orphaned: usize,
    /// Jobs whose status reply was discarded
    pub discarded: usize,
}

/// What to do with one job after its status reply
enum Observation {
    Finalise(JobStatus),
    Update(JobStatus),
    Unchanged,
}

pub struct MonitoringService {
    ctx: Arc<ManagerContext>,
    finaliser: FinalisationEngine,
}

impl MonitoringService {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        let finaliser = FinalisationEngine::new(Arc::clone(&ctx));
        Self { ctx, finaliser }
    }

    /// Runs one monitoring round over every tracked job
    pub async fn poll_once(&self) -> RoundSummary {
        let mut by_credential: HashMap<CredentialRequirement, Vec<TrackedJob>> = HashMap::new();
        for tracked in self.ctx.registry.tracked_jobs() {
            by_credential
                .entry(tracked.credential.clone())
                .or_default()
                .push(tracked);
        }

        let mut summary = RoundSummary::default();
        for (credential, jobs) in by_credential {
            self.monitor_group(&credential, jobs, &mut summary).await;
        }

        if summary.polled > 0 {
            debug!(
                "Monitoring round: {} polled, {} updated, {} queued for finalization",
                summary.polled, summary.updated, summary.queued
            );
        }
        summary
    }

    async fn monitor_group(
        &self,
        credential: &CredentialRequirement,
        jobs: Vec<TrackedJob>,
        summary: &mut RoundSummary,
    ) {
        let mut masters = BTreeSet::new();
        let mut requeue: Vec<(JobRef, JobStatus)> = Vec::new();
        let mut monitored: Vec<(TrackedJob, i64)> = Vec::new();

        for tracked in jobs {
            if tracked.job.sub.is_some() {
                masters.insert(tracked.job.root);
            }
            let Some(remote_id) = tracked.remote_id else {
                warn!("Job {} has no remote id, marking failed", tracked.job);
                self.update(tracked.job, JobStatus::Failed);
                summary.orphaned += 1;
                continue;
            };
            let known_final = tracked
                .remote_status
                .as_deref()
                .and_then(|remote| self.ctx.config.finalised_status(remote));
            match known_final {
                Some(terminal) => requeue.push((tracked.job, terminal)),
                None => monitored.push((tracked, remote_id)),
            }
        }

        if !monitored.is_empty() {
            let mut entered: BTreeMap<&'static str, Vec<(JobRef, i64)>> = BTreeMap::new();
            summary.polled += monitored.len();

            match self.query(credential, &monitored).await {
                Some(entries) => {
                    for ((tracked, remote_id), entry) in monitored.iter().zip(entries) {
                        match self.observe(tracked.job, &entry) {
                            Observation::Finalise(terminal) => {
                                entered.entry("final").or_default().push((tracked.job, *remote_id));
                                requeue.push((tracked.job, terminal));
                            }
                            Observation::Update(status) => {
                                if self.update(tracked.job, status) {
                                    summary.updated += 1;
                                    if status == JobStatus::Running {
                                        entered.entry("running").or_default().push((tracked.job, *remote_id));
                                    }
                                }
                                if entry.remote_status == "Completing" {
                                    entered.entry("completing").or_default().push((tracked.job, *remote_id));
                                }
                            }
                            Observation::Unchanged => {}
                        }
                    }
                }
                None => summary.discarded += monitored.len(),
            }

            for (state, jobs) in entered {
                self.record_state_times(credential, state, jobs).await;
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

        summary.queued += requeue.len();
        self.requeue(requeue).await;
    }

    /// Bulk status query; `None` when the reply cannot be trusted
    async fn query(
        &self,
        credential: &CredentialRequirement,
        monitored: &[(TrackedJob, i64)],
    ) -> Option<Vec<StatusEntry>> {
        let ids: Vec<i64> = monitored.iter().map(|(_, id)| *id).collect();
        let entries: Vec<StatusEntry> = match self
            .ctx
            .remote(credential, RemoteCommand::Status { ids })
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Status query for {} job(s) failed: {}", monitored.len(), e);
                return None;
            }
        };

        if entries.len() != monitored.len() {
            warn!(
                "Status reply has {} entries for {} job(s), discarding",
                entries.len(),
                monitored.len()
            );
            return None;
        }
        Some(entries)
    }

    /// Records the remote view of `job` and decides what happens next
    fn observe(&self, job: JobRef, entry: &StatusEntry) -> Observation {
        let config = &self.ctx.config;
        let result = self.ctx.registry.with_root(job, |root| {
            let master = job.sub.map(|_| root.status());
            let Some(target) = root.job_mut(job.sub) else {
                return Observation::Unchanged;
            };
            target.backend_state.status_info = entry.status_info.clone();
            target.backend_state.remote_status = Some(entry.remote_status.clone());
            target.backend_state.site = entry.site.clone();
            let current = target.status();

            if let Some(terminal) = config.finalised_status(&entry.remote_status) {
                if let FinaliseGate::Skip(reason) = finalise_gate(current, master, false) {
                    debug!("Job {}: finished remotely but not finalised, {}", job, reason);
                    return Observation::Unchanged;
                }
                if current == JobStatus::Submitted {
                    if let Err(e) = self.ctx.machine.update_status(
                        root,
                        job.sub,
                        JobStatus::Running,
                        UpdateOptions::local(),
                    ) {
                        warn!("Job {}: {}", job, e);
                    }
                }
                return Observation::Finalise(terminal);
            }

            if current.is_withdrawn() || matches!(current, JobStatus::Completing | JobStatus::Completed) {
                return Observation::Unchanged;
            }

            let mapped = config.map_remote_status(&entry.remote_status).or_else(|| {
                entry
                    .local_status
                    .as_deref()
                    .and_then(|s| s.parse::<JobStatus>().ok())
            });
            match mapped {
                Some(status) if status != current => Observation::Update(status),
                Some(_) => Observation::Unchanged,
                None => {
                    warn!("Job {}: unknown remote status '{}'", job, entry.remote_status);
                    Observation::Unchanged
                }
            }
        });
        result.unwrap_or(Observation::Unchanged)
    }

    /// Applies `status` without master propagation; true if it was committed
    fn update(&self, job: JobRef, status: JobStatus) -> bool {
        let result = self.ctx.registry.with_root(job, |root| {
            self.ctx
                .machine
                .update_status(root, job.sub, status, UpdateOptions::local())
        });
        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Job {}: status not updated: {}", job, e);
                false
            }
            Err(e) => {
                debug!("Job {} vanished during monitoring: {}", job, e);
                false
            }
        }
    }

    async fn record_state_times(
        &self,
        credential: &CredentialRequirement,
        state: &str,
        jobs: Vec<(JobRef, i64)>,
    ) {
        let command = RemoteCommand::StateTimes {
            ids: jobs.iter().map(|(_, id)| *id).collect(),
            state: state.to_string(),
        };
        let times: StateTimesReply = match self.ctx.remote(credential, command).await {
            Ok(times) => times,
            Err(e) => {
                warn!("Backend {} times for {} job(s) unavailable: {}", state, jobs.len(), e);
                return;
            }
        };

        for (job, remote_id) in jobs {
            if let Some(at) = times.get(&remote_id) {
                let _ = self.ctx.registry.with_root(job, |root| {
                    if let Some(target) = root.job_mut(job.sub) {
                        target.time.record_backend(state, *at);
                    }
                });
            }
        }
    }

    /// Marks jobs queued and hands them to the finalization engine
    async fn requeue(&self, jobs: Vec<(JobRef, JobStatus)>) {
        for (job, terminal) in jobs {
            let marked = self.ctx.registry.with_root(job, |root| {
                root.job_mut(job.sub).map(|target| target.been_queued = true)
            });
            if !matches!(marked, Ok(Some(()))) {
                continue;
            }

            if self.ctx.config.serialize_backend {
                if let Err(e) = self.finaliser.job_finalisation(job, terminal).await {
                    error!("Job {}: finalization failed: {}", job, e);
                }
                continue;
            }

            drop(self.ctx.pool.add_function(
                format!("finalise {}", job),
                FINALISE_PRIORITY,
                self.finaliser.queued_finalisation(job, terminal),
            ));
            info!("Job {} queued for finalization as {}", job, terminal);
        }
    }
}
