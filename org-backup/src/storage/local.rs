//! Local directory backend (air-gapped runs, development, tests).

use crate::storage::{ObjectMeta, ObjectStore};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BackupError::Storage {
                message: format!("invalid object key: {}", key),
                retryable: false,
            });
        }
        Ok(self.root.join(relative))
    }
}

fn storage_io_error(key: &str, e: std::io::Error) -> BackupError {
    BackupError::Storage {
        message: format!("cannot write {}: {}", key, e),
        retryable: false,
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_file(&self, key: &str, path: &Path, _meta: &ObjectMeta) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_io_error(key, e))?;
        }
        // written under a temporary name, then renamed into place
        let mut partial = dest.clone().into_os_string();
        partial.push(".partial");
        let stored = match tokio::fs::copy(path, &partial).await {
            Ok(_) => tokio::fs::rename(&partial, &dest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(storage_io_error(key, e));
        }
        debug!(key, dest = %dest.display(), "Stored object");
        Ok(())
    }

    async fn ensure_container(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            BackupError::StorageSetup(format!("cannot create {}: {}", self.root.display(), e))
        })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
