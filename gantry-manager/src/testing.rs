//! Test support: a scripted gateway and context builders

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::domain::backend::{BackendConfig, CredentialRequirement};
use gantry_core::domain::job::Application;
use gantry_core::dto::job::JobSpec;
use gantry_core::{JobRef, JobStatus, UpdateOptions};
use gantry_gateway::{
    Credential, CredentialProvider, GatewayReply, RemoteCommand, RemoteGateway, RemoteRequest,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::ManagerContext;

type Handler = Box<dyn Fn(&RemoteCommand) -> GatewayReply + Send + Sync>;

/// Gateway answering every command through a closure and recording the calls
pub struct ScriptedGateway {
    handler: Handler,
    calls: Mutex<Vec<RemoteCommand>>,
}

impl ScriptedGateway {
    pub fn new(handler: impl Fn(&RemoteCommand) -> GatewayReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RemoteCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of the command named `name`
    pub fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name() == name)
            .count()
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn execute(&self, request: RemoteRequest) -> gantry_gateway::Result<GatewayReply> {
        self.calls.lock().unwrap().push(request.command.clone());
        Ok((self.handler)(&request.command))
    }
}

pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn renew(&self, requirement: &CredentialRequirement) -> gantry_gateway::Result<Credential> {
        Ok(Credential {
            requirement: requirement.clone(),
            location: PathBuf::from("/tmp/gantry-test-proxy"),
            expires_at: Utc::now() + chrono::Duration::hours(12),
        })
    }
}

pub fn ok(value: serde_json::Value) -> GatewayReply {
    GatewayReply::Ok(value)
}

pub fn spec(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        application: Application {
            executable: "run.sh".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
        backend: BackendConfig::new("grid", CredentialRequirement::new("lhcb")),
        input_files: Vec::new(),
        output_files: Vec::new(),
        splitter: None,
        template: false,
    }
}

/// Configuration with intervals short enough for tests
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::new(root.to_path_buf());
    config.poll_interval = Duration::from_millis(10);
    config.submit_poll_interval = Duration::from_millis(2);
    config.finalise_backoff = Duration::from_millis(1);
    config.worker_count = 2;
    config
}

pub fn context_with(config: Config, gateway: Arc<ScriptedGateway>) -> Arc<ManagerContext> {
    ManagerContext::new(
        config,
        gateway,
        Arc::new(StaticCredentials),
        CancellationToken::new(),
    )
    .unwrap()
}

pub fn context(root: &Path, gateway: Arc<ScriptedGateway>) -> Arc<ManagerContext> {
    context_with(test_config(root), gateway)
}

/// Walks `job` through `path` with default options
pub fn advance(ctx: &ManagerContext, job: JobRef, path: &[JobStatus]) {
    let tree = ctx.registry.tree(job.root).unwrap();
    let mut root = tree.lock().unwrap();
    for status in path {
        ctx.machine
            .update_status(&mut root, job.sub, *status, UpdateOptions::default())
            .unwrap();
    }
}

/// Adds `count` subjobs to root job `id` and moves them through `path` in lockstep
pub fn split_into(ctx: &ManagerContext, id: u64, count: usize, path: &[JobStatus]) {
    let tree = ctx.registry.tree(id).unwrap();
    let mut root = tree.lock().unwrap();
    ctx.machine
        .update_status(&mut root, None, JobStatus::Submitting, UpdateOptions::default())
        .unwrap();
    for index in 0..count {
        let sj = root.make_subjob(index, Vec::new());
        root.subjobs.push(sj);
    }
    for status in path {
        for index in 0..count {
            ctx.machine
                .update_status(&mut root, Some(index), *status, UpdateOptions::local())
                .unwrap();
        }
        ctx.machine.update_master_status(&mut root).unwrap();
    }
}

pub fn status_of(ctx: &ManagerContext, job: JobRef) -> JobStatus {
    ctx.registry.status(job).unwrap()
}

pub fn set_remote_id(ctx: &ManagerContext, job: JobRef, remote_id: i64) {
    ctx.registry
        .with_root(job, |root| {
            if let Some(j) = root.job_mut(job.sub) {
                j.backend_state.remote_id = Some(remote_id);
            }
        })
        .unwrap();
}
