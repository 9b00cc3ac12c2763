//! Backend configuration and remote state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::resubmit::{Changeability, FieldRule};

/// Identifies which credential a remote session needs
///
/// Jobs with different requirements can never share one bulk remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialRequirement {
    pub vo: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl CredentialRequirement {
    pub fn new(vo: impl Into<String>) -> Self {
        Self {
            vo: vo.into(),
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Display for CredentialRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{}", self.vo, group),
            None => f.write_str(&self.vo),
        }
    }
}

/// User-facing backend configuration of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type name; fixed for the lifetime of a job
    pub kind: String,
    pub credential: CredentialRequirement,
    /// Free-form middleware settings (destination site, CPU time, priority, ...)
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
    /// Finalise subjobs in one bulk call once the whole master has finished
    #[serde(default)]
    pub finalise_on_master: bool,
    #[serde(default = "default_true")]
    pub download_sandbox: bool,
    #[serde(default = "default_true")]
    pub unpack_sandbox: bool,
}

fn default_true() -> bool {
    true
}

/// Fields a user may change when resubmitting
const CREDENTIAL_RULES: &[FieldRule] = &[
    FieldRule::new("vo", Changeability::Fixed),
    FieldRule::new("group", Changeability::Changeable),
];

const BACKEND_RULES: &[FieldRule] = &[
    FieldRule::new("kind", Changeability::Fixed),
    FieldRule::new("credential", Changeability::Nested(CREDENTIAL_RULES)),
    FieldRule::new("settings", Changeability::Changeable),
    FieldRule::new("finalise_on_master", Changeability::Fixed),
    FieldRule::new("download_sandbox", Changeability::Changeable),
    FieldRule::new("unpack_sandbox", Changeability::Changeable),
];

impl BackendConfig {
    pub fn new(kind: impl Into<String>, credential: CredentialRequirement) -> Self {
        Self {
            kind: kind.into(),
            credential,
            settings: BTreeMap::new(),
            finalise_on_master: false,
            download_sandbox: true,
            unpack_sandbox: true,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// The changeable-at-resubmit allow-list for backend configurations
    pub fn resubmit_rules() -> &'static [FieldRule] {
        BACKEND_RULES
    }
}

/// Last known remote state of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    /// Identifier assigned by the workload-management service
    pub remote_id: Option<i64>,
    /// Raw remote status string
    pub remote_status: Option<String>,
    /// Site the job was matched to
    pub site: Option<String>,
    pub norm_cpu_time: Option<String>,
    #[serde(default)]
    pub status_info: String,
    pub extra_info: Option<String>,
}

impl BackendState {
    /// Clears everything learnt from a previous submission
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
