//! Monitoring loop
//!
//! Ticks the monitoring service on the configured poll interval. Rounds never
//! overlap: the next tick is taken only after the previous round returned.

use std::sync::Arc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::context::ManagerContext;
use crate::service::{MonitoringService, RoundSummary};

pub struct MonitoringLoop {
    ctx: Arc<ManagerContext>,
    service: MonitoringService,
}

impl MonitoringLoop {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        let service = MonitoringService::new(Arc::clone(&ctx));
        Self { ctx, service }
    }

    /// Runs rounds until the context is shut down
    pub async fn run(&self) {
        info!(
            "Starting monitoring loop (interval: {:?})",
            self.ctx.config.poll_interval
        );

        let mut interval = time::interval(self.ctx.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.round().await;
        }

        info!("Monitoring loop stopped");
    }

    /// Runs rounds until no job has remote work left
    ///
    /// Returns `false` if `max_rounds` elapsed or shutdown was requested first.
    pub async fn run_until_settled(&self, max_rounds: Option<usize>) -> bool {
        let mut interval = time::interval(self.ctx.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rounds = 0;

        loop {
            if self.ctx.registry.is_settled() {
                info!("All jobs settled after {} round(s)", rounds);
                return true;
            }
            if max_rounds.is_some_and(|max| rounds >= max) {
                info!("Stopping after {} round(s) with jobs still active", rounds);
                return false;
            }

            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return false,
                _ = interval.tick() => {}
            }
            self.round().await;
            rounds += 1;
        }
    }

    async fn round(&self) -> RoundSummary {
        debug!("Polling remote status");
        let summary = self.service.poll_once().await;
        if summary.updated > 0 || summary.queued > 0 {
            info!(
                "Round: {} job(s) updated, {} queued for finalization",
                summary.updated, summary.queued
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGateway, advance, context, ok, set_remote_id, spec};
    use gantry_core::JobStatus;
    use gantry_gateway::{GatewayReply, RemoteCommand};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_until_jobs_settle() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = ScriptedGateway::new(|cmd| match cmd {
            RemoteCommand::Status { ids } => ok(json!(
                ids.iter()
                    .map(|_| json!({"remote_status": "Done"}))
                    .collect::<Vec<_>>()
            )),
            RemoteCommand::StateTimes { .. } => ok(json!({})),
            RemoteCommand::FinishedJob { .. } => ok(json!({"sandbox": {"ok": true}})),
            _ => GatewayReply::Failed("unexpected".into()),
        });
        let ctx = context(dir.path(), gateway);
        let job = ctx.registry.create(spec("settle"));
        advance(&ctx, job, &[JobStatus::Submitting, JobStatus::Submitted]);
        set_remote_id(&ctx, job, 9);

        let settled = MonitoringLoop::new(Arc::clone(&ctx))
            .run_until_settled(Some(100))
            .await;

        assert!(settled);
        assert_eq!(ctx.registry.status(job).unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = ScriptedGateway::new(|cmd| match cmd {
            RemoteCommand::Status { ids } => ok(json!(
                ids.iter()
                    .map(|_| json!({"remote_status": "Waiting"}))
                    .collect::<Vec<_>>()
            )),
            _ => GatewayReply::Failed("unexpected".into()),
        });
        let ctx = context(dir.path(), gateway.clone());
        let job = ctx.registry.create(spec("stuck"));
        advance(&ctx, job, &[JobStatus::Submitting, JobStatus::Submitted]);
        set_remote_id(&ctx, job, 3);

        let settled = MonitoringLoop::new(Arc::clone(&ctx))
            .run_until_settled(Some(3))
            .await;

        assert!(!settled);
        assert_eq!(gateway.count("status"), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), ScriptedGateway::new(|_| ok(json!([]))));
        let monitor = MonitoringLoop::new(Arc::clone(&ctx));

        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            shutdown.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), monitor.run())
            .await
            .unwrap();
    }
}
