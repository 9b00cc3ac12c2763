//! Submission payloads
//!
//! Payloads are built in two phases: one master-level configuration shared by
//! every target, then one configuration per target.

use gantry_core::Job;
use gantry_core::domain::files::FileKind;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::error::JobError;

/// Shared part of every payload of one submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub settings: BTreeMap<String, Value>,
}

/// Builds the backend-specific description of each target
pub trait RuntimeHandler: Send + Sync {
    fn master_prepare(&self, master: &Job) -> Result<MasterConfig, JobError>;

    fn prepare(&self, job: &Job, master: &MasterConfig) -> Result<Value, JobError>;
}

/// JSON job description understood by the remote bridge
pub struct StandardRuntime;

impl RuntimeHandler for StandardRuntime {
    fn master_prepare(&self, master: &Job) -> Result<MasterConfig, JobError> {
        if master.application.executable.trim().is_empty() {
            return Err(JobError::Validation(format!(
                "job {} has no executable",
                master.fqid()
            )));
        }

        Ok(MasterConfig {
            executable: master.application.executable.clone(),
            args: master.application.args.clone(),
            env: master.application.env.clone(),
            settings: master.backend.settings.clone(),
        })
    }

    fn prepare(&self, job: &Job, master: &MasterConfig) -> Result<Value, JobError> {
        let patterns = |kind: FileKind| -> Vec<&str> {
            job.output_files
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.pattern.as_str())
                .collect()
        };

        Ok(json!({
            "name": format!("{}_{}", job.name, job.fqid()),
            "executable": master.executable,
            "arguments": master.args,
            "environment": master.env,
            "input_data": job.input_files,
            "output_sandbox": patterns(FileKind::Sandbox),
            "output_data": patterns(FileKind::Remote),
            "settings": master.settings,
        }))
    }
}
