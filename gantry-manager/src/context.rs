//! Manager context
//!
//! Everything the services share: configuration, the job registry, the state
//! machine, the gateway, the credential store, the worker pool and the
//! workspace. Built once and passed around as `Arc<ManagerContext>`.

use anyhow::Context as AnyhowContext;
use gantry_core::domain::backend::CredentialRequirement;
use gantry_core::{StateMachine, TransitionHooks};
use gantry_gateway::{CredentialProvider, CredentialStore, RemoteCommand, RemoteGateway, RemoteRequest};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::JobError;
use crate::hooks::StandardHooks;
use crate::pool::WorkerPool;
use crate::registry::JobRegistry;
use crate::workspace::Workspace;

/// Credentials expiring within this window are renewed before use
const CREDENTIAL_MARGIN_MINUTES: i64 = 10;

pub struct ManagerContext {
    pub config: Config,
    pub registry: JobRegistry,
    pub machine: StateMachine,
    pub gateway: Arc<dyn RemoteGateway>,
    pub credentials: CredentialStore,
    pub pool: WorkerPool,
    pub workspace: Workspace,
    pub shutdown: CancellationToken,
}

impl ManagerContext {
    /// Creates a context with the standard transition hooks and starts the pool
    pub fn new(
        config: Config,
        gateway: Arc<dyn RemoteGateway>,
        provider: Arc<dyn CredentialProvider>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let hooks = StandardHooks::new(Workspace::new(config.workspace_root.clone()));
        Self::with_hooks(config, gateway, provider, Arc::new(hooks), shutdown)
    }

    pub fn with_hooks(
        config: Config,
        gateway: Arc<dyn RemoteGateway>,
        provider: Arc<dyn CredentialProvider>,
        hooks: Arc<dyn TransitionHooks>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("Invalid manager configuration")?;

        let machine = StateMachine::new(hooks)
            .context("Invalid transition graph")?
            .fail_if_no_output_matched(config.fail_if_no_output_matched);

        let credentials = CredentialStore::new(
            provider,
            chrono::Duration::minutes(CREDENTIAL_MARGIN_MINUTES),
        );
        let pool = WorkerPool::start(config.worker_count, shutdown.child_token());
        let workspace = Workspace::new(config.workspace_root.clone());

        Ok(Arc::new(Self {
            config,
            registry: JobRegistry::new(),
            machine,
            gateway,
            credentials,
            pool,
            workspace,
            shutdown,
        }))
    }

    /// Runs `command` with the credential for `requirement` and decodes the reply
    pub async fn remote<T: DeserializeOwned>(
        &self,
        requirement: &CredentialRequirement,
        command: RemoteCommand,
    ) -> Result<T, JobError> {
        let credential = self.credentials.get(requirement).await?;
        let request =
            RemoteRequest::new(command, self.config.gateway_timeout).with_credential(credential);
        Ok(gantry_gateway::call(self.gateway.as_ref(), request).await?)
    }
}
