//! Gantry Gateway
//!
//! The channel between the job manager and the remote workload-management
//! service.
//!
//! - `gateway`: the `RemoteGateway` trait and the typed `call` helper
//! - `command`: remote command vocabulary and reply types
//! - `process`: a gateway that runs an external bridge program per command
//! - `credential`: the shared credential store
//!
//! # Example
//!
//! ```no_run
//! use gantry_gateway::{ProcessGateway, RemoteCommand, RemoteRequest, StatusEntry, call};
//! use std::time::Duration;
//!
//! # async fn demo() -> gantry_gateway::Result<()> {
//! let gateway = ProcessGateway::new("/usr/bin/grid-bridge");
//! let request = RemoteRequest::new(RemoteCommand::Status { ids: vec![42] }, Duration::from_secs(60));
//! let statuses: Vec<StatusEntry> = call(&gateway, request).await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod process;

// Re-export commonly used types
pub use command::{
    BatchEntry, FileLocation, FinaliseEntry, FinaliseJobsReply, FinishedJobReply, RemoteCommand,
    SandboxResult, StateTimesReply, StatusEntry, SubmitOutcome, SubmitReply,
};
pub use credential::{Credential, CredentialProvider, CredentialStore, FileCredentialProvider};
pub use error::{GatewayError, Result};
pub use gateway::{GatewayReply, RemoteGateway, RemoteRequest, call};
pub use process::ProcessGateway;
