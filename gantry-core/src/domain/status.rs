//! Job status vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseStatusError;

/// Local job status
///
/// `Incomplete`, `Unknown` and `Removed` are transient error states.
/// `Template` jobs are never submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Completing,
    Completed,
    Failed,
    Killed,
    Unknown,
    Incomplete,
    Template,
    Removed,
}

impl JobStatus {
    /// Every status, in declaration order
    pub const ALL: [JobStatus; 12] = [
        JobStatus::New,
        JobStatus::Submitting,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Completing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Killed,
        JobStatus::Unknown,
        JobStatus::Incomplete,
        JobStatus::Template,
        JobStatus::Removed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Submitting => "submitting",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Completing => "completing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Unknown => "unknown",
            JobStatus::Incomplete => "incomplete",
            JobStatus::Template => "template",
            JobStatus::Removed => "removed",
        }
    }

    /// Jobs in these states are tracked by the monitoring loop
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running)
    }

    /// No further remote activity is expected for a job in this state
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Killed
                | JobStatus::Removed
                | JobStatus::Unknown
                | JobStatus::Incomplete
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobStatus::Incomplete | JobStatus::Unknown | JobStatus::Removed
        )
    }

    /// Killed or removed by a user; background work must leave the job alone
    pub fn is_withdrawn(&self) -> bool {
        matches!(self, JobStatus::Killed | JobStatus::Removed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
