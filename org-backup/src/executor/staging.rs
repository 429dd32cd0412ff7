//! Per-repository scratch space.
//!
//! Layout: `{work_dir}/staging/{repository}/{class}/...`. Each artifact class
//! gets its own directory, which is reclaimed as soon as the class has been
//! uploaded; the whole area goes away when the repository is done (or the
//! area is dropped).

use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Create a fresh staging area for `repository`, discarding leftovers of
    /// an interrupted earlier run.
    pub async fn create(work_dir: &Path, repository: &str) -> Result<Self> {
        let root = work_dir.join("staging").join(repository);
        if tokio::fs::try_exists(&root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one artifact class, created on demand.
    pub async fn class_dir(&self, class: &str) -> Result<PathBuf> {
        let dir = self.root.join(class);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Delete everything staged for `class`.
    pub async fn reclaim_class(&self, class: &str) -> Result<()> {
        remove_if_exists(&self.root.join(class)).await
    }

    /// Bytes currently staged.
    pub fn usage_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    /// Delete the whole staging area.
    pub async fn reclaim(&self) -> Result<()> {
        remove_if_exists(&self.root).await
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                warn!(path = %self.root.display(), error = %e, "Failed to remove staging area");
            }
        }
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_classes_are_reclaimed_independently() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingArea::create(tmp.path(), "widgets").await.unwrap();

        let git = staging.class_dir("git").await.unwrap();
        std::fs::write(git.join("pack"), vec![0u8; 1000]).unwrap();
        let meta = staging.class_dir("metadata").await.unwrap();
        std::fs::write(meta.join("labels.json"), b"[]").unwrap();
        assert_eq!(staging.usage_bytes(), 1002);

        staging.reclaim_class("git").await.unwrap();
        assert!(!git.exists());
        assert_eq!(staging.usage_bytes(), 2);

        // reclaiming twice is fine
        staging.reclaim_class("git").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_discards_leftovers_and_drop_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join("staging/widgets/git");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("old.tar.gz"), b"stale").unwrap();

        let staging = StagingArea::create(tmp.path(), "widgets").await.unwrap();
        assert_eq!(staging.usage_bytes(), 0);
        let root = staging.root().to_path_buf();

        drop(staging);
        assert!(!root.exists());
    }
}
