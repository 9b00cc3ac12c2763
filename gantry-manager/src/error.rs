//! Error types for job management operations

use gantry_core::JobStatusError;
use gantry_core::error::ChangeError;
use gantry_gateway::GatewayError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by submit, kill, remove, resubmit and background work
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Status(#[from] JobStatusError),

    /// No target reached the remote system
    #[error("submission of job {fqid} failed for {} target(s)", .failures.len())]
    IncompleteSubmission {
        fqid: String,
        failures: BTreeMap<String, String>,
    },

    #[error("backend error: {0}")]
    Backend(#[from] GatewayError),

    /// The remote reply did not account for every request
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("disk space exhausted: {0}")]
    DiskSpace(String),

    #[error("splitting failed: {0}")]
    Split(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error(transparent)]
    Change(#[from] ChangeError),

    /// A pool task was dropped or panicked before producing a result
    #[error("task {0} did not complete")]
    TaskLost(String),
}

impl JobError {
    /// Check if retrying cannot help because the disk is full
    pub fn is_disk_space(&self) -> bool {
        match self {
            Self::DiskSpace(_) => true,
            Self::Backend(e) => e.is_disk_space(),
            Self::Workspace(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }

    /// Converts local write failures, classifying a full disk
    pub fn from_write(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            Self::DiskSpace(format!("{}: {}", what, err))
        } else {
            Self::Workspace(err)
        }
    }
}
