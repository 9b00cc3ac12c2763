//! Subprocess gateway
//!
//! Runs an external bridge program once per command. The command is written
//! to the child's stdin as JSON; the child answers on stdout with an
//! envelope `{"OK": bool, "Value": ..., "Message": "..."}`.
//!
//! The credential location is exported as `X509_USER_PROXY`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{GatewayReply, RemoteGateway, RemoteRequest};

/// Environment variable carrying the credential location
pub const CREDENTIAL_ENV: &str = "X509_USER_PROXY";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "OK")]
    ok: bool,
    #[serde(rename = "Value", default)]
    value: serde_json::Value,
    #[serde(rename = "Message", default)]
    message: String,
}

/// Gateway that shells out to a bridge program
#[derive(Debug, Clone)]
pub struct ProcessGateway {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ProcessGateway {
    /// Creates a gateway running `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Adds a variable exported to every invocation
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, request: &RemoteRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credential) = &request.credential {
            cmd.env(CREDENTIAL_ENV, &credential.location);
        }

        cmd
    }

    async fn run(&self, request: &RemoteRequest) -> Result<GatewayReply> {
        let input = serde_json::to_vec(&request.command)
            .map_err(|e| GatewayError::Parse(format!("cannot encode command: {}", e)))?;

        let mut child = self.command(request).spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", request.command.name(), stderr.trim());
        }

        match serde_json::from_str::<Envelope>(stdout.trim()) {
            Ok(envelope) if envelope.ok => Ok(GatewayReply::Ok(envelope.value)),
            Ok(envelope) => Ok(GatewayReply::Failed(envelope.message)),
            Err(_) if !output.status.success() => {
                let message = if stderr.trim().is_empty() {
                    format!("gateway exited with {}", output.status)
                } else {
                    stderr.trim().to_string()
                };
                Ok(GatewayReply::Failed(message))
            }
            Err(e) => Err(GatewayError::Parse(format!(
                "{} reply is not an envelope: {}",
                request.command.name(),
                e
            ))),
        }
    }
}

#[async_trait]
impl RemoteGateway for ProcessGateway {
    async fn execute(&self, request: RemoteRequest) -> Result<GatewayReply> {
        match tokio::time::timeout(request.timeout, self.run(&request)).await {
            Ok(reply) => reply,
            Err(_) => {
                // Dropping the future drops the child, which kills it.
                warn!(
                    "Command {} timed out after {:?}, killed",
                    request.command.name(),
                    request.timeout
                );
                Ok(GatewayReply::TimedOut)
            }
        }
    }
}
