//! Error types for the remote gateway

use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur when talking to the remote service
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway process could not be started or fed
    #[error("failed to run gateway: {0}")]
    Spawn(#[from] std::io::Error),

    /// The remote service reported a failure
    #[error("{command} failed: {message}")]
    Remote {
        /// Command name
        command: String,
        /// Message returned by the service
        message: String,
    },

    /// The command did not finish within its timeout and was killed
    #[error("{command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    /// The reply could not be decoded
    #[error("malformed reply: {0}")]
    Parse(String),

    /// No usable credential
    #[error("credential error: {0}")]
    Credential(String),
}

impl GatewayError {
    /// Create a remote error from a command name and message
    pub fn remote(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Check if the failure was caused by a full disk, locally or remotely
    pub fn is_disk_space(&self) -> bool {
        match self {
            Self::Spawn(e) => e.kind() == std::io::ErrorKind::StorageFull,
            Self::Remote { message, .. } => mentions_disk_space(message),
            _ => false,
        }
    }
}

/// Check if a message reports an exhausted disk or quota
pub fn mentions_disk_space(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no space left on device") || lower.contains("disk quota exceeded")
}
