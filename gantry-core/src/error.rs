//! Error types for the job state machine

use thiserror::Error;

use crate::domain::status::JobStatus;
use crate::state::graph::Hook;

/// A status transition that was refused or failed
///
/// The job is left in the status it had before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobStatusError {
    #[error("forbidden status transition of job {fqid} from '{from}' to '{to}'")]
    Forbidden {
        fqid: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("{hook:?} hook failed for job {fqid}: {message}")]
    Hook {
        fqid: String,
        hook: Hook,
        message: String,
    },

    #[error("post-processing failed for job {fqid}: {message}")]
    Postprocess { fqid: String, message: String },

    #[error("cannot force job {fqid} from '{from}' to '{to}'")]
    ForceNotAllowed {
        fqid: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {fqid} has no subjob {index}")]
    NoSuchSubjob { fqid: String, index: usize },
}

impl JobStatusError {
    /// Check if the error is a refused transition rather than a failed hook
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. } | Self::ForceNotAllowed { .. })
    }
}

/// Raised by a transition hook
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HookSignal {
    /// Commit `0` instead of the requested status
    #[error("status override to '{0}'")]
    Override(JobStatus),

    #[error("{0}")]
    Failed(String),
}

/// The built-in transition table is inconsistent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("state '{0}' has no entry in the transition graph")]
    MissingState(JobStatus),

    #[error("duplicate transition from '{from}' to '{to}'")]
    DuplicateEdge { from: JobStatus, to: JobStatus },

    #[error("template jobs must not be submittable")]
    TemplateSubmittable,

    #[error("removed is terminal but has outgoing transitions")]
    RemovedHasExits,

    #[error("new jobs cannot be submitted")]
    NewNotSubmittable,
}

/// A configuration change refused at resubmit
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChangeError {
    #[error("'{field}' cannot be changed at resubmit")]
    NotChangeable { field: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("unknown job status '{0}'")]
pub struct ParseStatusError(pub String);
