//! Gateway abstraction
//!
//! `RemoteGateway::execute` is the single channel to the remote service.
//! A call may block for its whole timeout; on expiry the implementation
//! kills the operation and returns `GatewayReply::TimedOut` instead of an error.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::command::RemoteCommand;
use crate::credential::Credential;
use crate::error::{GatewayError, Result};

/// A command together with its execution context
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub command: RemoteCommand,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub credential: Option<Credential>,
}

impl RemoteRequest {
    pub fn new(command: RemoteCommand, timeout: Duration) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            timeout,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Raw outcome of a remote command
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayReply {
    Ok(serde_json::Value),
    Failed(String),
    TimedOut,
}

/// Service trait for executing remote commands
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Executes a command
    ///
    /// `Err` is reserved for local failures (the gateway could not run at all);
    /// remote failures and timeouts are replies.
    async fn execute(&self, request: RemoteRequest) -> Result<GatewayReply>;
}

/// Executes `request` and decodes a successful reply into `T`
///
/// Remote failures and timeouts become errors.
pub async fn call<T: DeserializeOwned>(
    gateway: &dyn RemoteGateway,
    request: RemoteRequest,
) -> Result<T> {
    let command = request.command.name();
    let timeout = request.timeout;

    debug!("Executing remote command {}", command);

    match gateway.execute(request).await? {
        GatewayReply::Ok(value) => serde_json::from_value(value)
            .map_err(|e| GatewayError::Parse(format!("{} reply: {}", command, e))),
        GatewayReply::Failed(message) => {
            warn!("Remote command {} failed: {}", command, message);
            Err(GatewayError::remote(command, message))
        }
        GatewayReply::TimedOut => {
            warn!("Remote command {} timed out after {:?}", command, timeout);
            Err(GatewayError::TimedOut {
                command: command.to_string(),
                timeout,
            })
        }
    }
}
