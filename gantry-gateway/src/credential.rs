//! Credential store
//!
//! Credentials are keyed by their requirement. Many workers read them
//! concurrently; renewal is serialized so one expiring credential is renewed once.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gantry_core::domain::backend::CredentialRequirement;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{GatewayError, Result};

/// A usable credential
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub requirement: CredentialRequirement,
    pub location: PathBuf,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True if the credential is still valid `margin` from now
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        Utc::now() + margin < self.expires_at
    }
}

/// Source of fresh credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn renew(&self, requirement: &CredentialRequirement) -> Result<Credential>;
}

/// Provider backed by an externally maintained credential file
///
/// The file is expected to be refreshed by another tool; each renewal
/// checks that it exists and grants it `lifetime`.
pub struct FileCredentialProvider {
    path: PathBuf,
    lifetime: Duration,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>, lifetime: Duration) -> Self {
        Self {
            path: path.into(),
            lifetime,
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn renew(&self, requirement: &CredentialRequirement) -> Result<Credential> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Err(GatewayError::Credential(format!(
                "credential file {} for {} does not exist",
                self.path.display(),
                requirement
            )));
        }

        Ok(Credential {
            requirement: requirement.clone(),
            location: self.path.clone(),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

/// Shared cache of credentials
pub struct CredentialStore {
    provider: Arc<dyn CredentialProvider>,
    credentials: RwLock<HashMap<CredentialRequirement, Credential>>,
    renewal: Mutex<()>,
    margin: Duration,
}

impl CredentialStore {
    /// Creates a store renewing credentials that expire within `margin`
    pub fn new(provider: Arc<dyn CredentialProvider>, margin: Duration) -> Self {
        Self {
            provider,
            credentials: RwLock::new(HashMap::new()),
            renewal: Mutex::new(()),
            margin,
        }
    }

    async fn cached(&self, requirement: &CredentialRequirement) -> Option<Credential> {
        let credentials = self.credentials.read().await;
        credentials
            .get(requirement)
            .filter(|c| c.is_valid_for(self.margin))
            .cloned()
    }

    /// Returns a valid credential for `requirement`, renewing it if needed
    pub async fn get(&self, requirement: &CredentialRequirement) -> Result<Credential> {
        if let Some(credential) = self.cached(requirement).await {
            return Ok(credential);
        }

        let _renewing = self.renewal.lock().await;

        // Another task may have renewed while we waited.
        if let Some(credential) = self.cached(requirement).await {
            return Ok(credential);
        }

        let credential = self.provider.renew(requirement).await?;
        info!(
            "Renewed credential for {} (valid until {})",
            requirement, credential.expires_at
        );

        self.credentials
            .write()
            .await
            .insert(requirement.clone(), credential.clone());

        Ok(credential)
    }

    /// Drops a cached credential, forcing renewal on next use
    pub async fn invalidate(&self, requirement: &CredentialRequirement) {
        self.credentials.write().await.remove(requirement);
    }
}
