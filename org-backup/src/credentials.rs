//! Credential lookup.
//!
//! The secret store itself is external; the engine only needs an access token
//! for the source-control API and, optionally, static storage credentials.
//! Both providers understand the same secret document shape:
//!
//! ```json
//! {
//!   "GITHUB_TOKEN": "...",
//!   "AWS_ACCESS_KEY_ID": "...",
//!   "AWS_SECRET_ACCESS_KEY": "...",
//!   "AWS_REGION": "eu-west-1"
//! }
//! ```

use crate::config::{CredentialSource, CredentialsConfig};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

#[derive(Clone)]
pub struct Credentials {
    pub access_token: String,
    /// None means "use the default storage credential chain"
    pub storage: Option<StorageCredentials>,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("storage", &self.storage)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self) -> Result<Credentials>;
}

#[derive(Debug, Default, Deserialize)]
struct SecretDocument {
    #[serde(rename = "GITHUB_TOKEN")]
    github_token: Option<String>,
    #[serde(rename = "AWS_ACCESS_KEY_ID")]
    access_key_id: Option<String>,
    #[serde(rename = "AWS_SECRET_ACCESS_KEY")]
    secret_access_key: Option<String>,
    #[serde(rename = "AWS_SESSION_TOKEN")]
    session_token: Option<String>,
    #[serde(rename = "AWS_REGION")]
    region: Option<String>,
}

impl SecretDocument {
    fn into_credentials(self) -> Result<Credentials> {
        let access_token = self
            .github_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BackupError::Credentials("GITHUB_TOKEN is missing".into()))?;

        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let storage = match (non_empty(self.access_key_id), non_empty(self.secret_access_key)) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StorageCredentials {
                access_key_id,
                secret_access_key,
                session_token: non_empty(self.session_token),
                region: non_empty(self.region),
            }),
            (None, None) => None,
            _ => {
                return Err(BackupError::Credentials(
                    "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together".into(),
                ))
            }
        };

        Ok(Credentials { access_token, storage })
    }
}

/// Reads the secret document keys from the process environment.
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credentials(&self) -> Result<Credentials> {
        let var = |key: &str| std::env::var(key).ok();
        SecretDocument {
            github_token: var("GITHUB_TOKEN"),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            session_token: var("AWS_SESSION_TOKEN"),
            region: var("AWS_REGION"),
        }
        .into_credentials()
    }
}

/// Reads a JSON secret document from a file (e.g. a mounted secret).
#[derive(Debug)]
pub struct FileCredentialProvider {
    path: PathBuf,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn get_credentials(&self) -> Result<Credentials> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BackupError::Credentials(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let document: SecretDocument = serde_json::from_str(&content).map_err(|e| {
            BackupError::Credentials(format!("invalid secret document {}: {}", self.path.display(), e))
        })?;
        document.into_credentials()
    }
}

pub fn provider_from_config(config: &CredentialsConfig) -> Result<Box<dyn CredentialProvider>> {
    match config.source {
        CredentialSource::Env => Ok(Box::new(EnvCredentialProvider)),
        CredentialSource::File => {
            let path = config.secret_file.clone().ok_or_else(|| {
                BackupError::Config("credentials.secret_file is not set".into())
            })?;
            Ok(Box::new(FileCredentialProvider::new(path)))
        }
    }
}
