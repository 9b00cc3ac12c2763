//! Service layer
//!
//! Services drive jobs through their lifecycle against the remote system:
//! batched submission, the monitoring round, output finalization, and the
//! user-facing operations built on top of them.

mod finalisation;
mod lifecycle;
mod monitoring;
mod submission;

pub use finalisation::{FinaliseGate, FinalisationEngine, finalise_gate};
pub use lifecycle::{JobManager, SubmitOptions};
pub use monitoring::{MonitoringService, RoundSummary};
pub use submission::{SubmissionEngine, SubmissionReport, SubmissionTarget};
