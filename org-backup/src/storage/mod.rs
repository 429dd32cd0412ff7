//! Object storage destinations for backup artifacts.

pub mod local;
pub mod s3;
pub mod uploader;

use crate::config::{StorageBackend, StorageConfig};
use crate::credentials::StorageCredentials;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use local::LocalStore;
pub use s3::S3Store;
pub use uploader::{KeyLayout, Uploader};

/// Headers stored with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

impl ObjectMeta {
    pub const ARCHIVE: ObjectMeta = ObjectMeta {
        content_type: "application/gzip",
        content_encoding: None,
    };

    pub const JSON: ObjectMeta = ObjectMeta {
        content_type: "application/json",
        content_encoding: None,
    };

    pub const GZIPPED_JSON: ObjectMeta = ObjectMeta {
        content_type: "application/json",
        content_encoding: Some("gzip"),
    };
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the file at `path` under `key`, replacing any existing object.
    async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<()>;

    /// Make sure the destination exists, creating it when missing.
    async fn ensure_container(&self) -> Result<()>;

    /// Human-readable destination, for logs and the report.
    fn describe(&self) -> String;
}

/// Build the configured backend.
pub async fn store_from_config(
    config: &StorageConfig,
    credentials: Option<&StorageCredentials>,
) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::S3 => Ok(Arc::new(S3Store::new(config, credentials).await?)),
        StorageBackend::Local => {
            let root = config.local_root.clone().ok_or_else(|| {
                BackupError::Config("storage.local_root is required for the local backend".into())
            })?;
            Ok(Arc::new(LocalStore::new(root)))
        }
    }
}
