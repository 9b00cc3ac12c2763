//! Gantry Manager
//!
//! Client-side management of grid jobs: submits jobs in batches, polls their
//! remote status, collects their output and keeps every master job's status
//! consistent with its subjobs.
//!
//! - `context`: the shared `ManagerContext` every service works from
//! - `registry`: in-memory job trees addressed by `JobRef`
//! - `service`: submission, monitoring, finalization and the `JobManager`
//! - `scheduler`: the monitoring loop
//! - `pool`: the prioritized worker pool running background remote work
//!
//! # Example
//!
//! ```no_run
//! use gantry_gateway::{FileCredentialProvider, ProcessGateway};
//! use gantry_manager::{Config, JobManager, ManagerContext, MonitoringLoop, SubmitOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(spec: gantry_core::dto::job::JobSpec) -> anyhow::Result<()> {
//! let ctx = ManagerContext::new(
//!     Config::from_env()?,
//!     Arc::new(ProcessGateway::new("/usr/bin/grid-bridge")),
//!     Arc::new(FileCredentialProvider::new("/tmp/x509up", chrono::Duration::hours(12))),
//!     CancellationToken::new(),
//! )?;
//! let manager = JobManager::new(Arc::clone(&ctx));
//! let job = manager.create_job(spec);
//! manager.submit(job.root, SubmitOptions::default()).await?;
//! MonitoringLoop::new(ctx).run_until_settled(None).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod locations;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod split;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use context::ManagerContext;
pub use error::JobError;
pub use registry::JobRegistry;
pub use scheduler::MonitoringLoop;
pub use service::{JobManager, MonitoringService, SubmissionReport, SubmitOptions};
