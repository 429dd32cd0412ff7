//! Artifact upload: storage key layout plus retrying transfer.

use crate::budget::TimeBudget;
use crate::executor::{ArtifactKind, BackupArtifact};
use crate::report::UploadedArtifact;
use crate::storage::{ObjectMeta, ObjectStore};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_bytes;
use crate::utils::retry::RetryPolicy;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Storage keys of one run. Keys only depend on repository, artifact and
/// run date, so re-running on the same day overwrites the same objects.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: Option<String>,
    run_date: String,
}

impl KeyLayout {
    pub fn new(prefix: Option<&str>, run_date: NaiveDate) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            prefix,
            run_date: run_date.format("%Y-%m-%d").to_string(),
        }
    }

    fn prefixed(&self, key: String) -> String {
        match self.prefix {
            Some(ref prefix) => format!("{}/{}", prefix, key),
            None => key,
        }
    }

    /// `{repo}/git_backup_{date}.tar.gz` or `{repo}/wiki_backup_{date}.tar.gz`
    pub fn mirror_key(&self, repository: &str, kind: ArtifactKind) -> String {
        self.prefixed(format!(
            "{}/{}_backup_{}.tar.gz",
            repository,
            kind.key_stem(),
            self.run_date
        ))
    }

    /// `{repo}/metadata/{repo}_{resource}.json`
    pub fn metadata_key(&self, repository: &str, resource: &str) -> String {
        self.prefixed(format!("{}/metadata/{}_{}.json", repository, repository, resource))
    }

    pub fn key_for(&self, artifact: &BackupArtifact) -> String {
        match (artifact.kind, artifact.resource.as_deref()) {
            (ArtifactKind::MetadataCollection, Some(resource)) => {
                self.metadata_key(&artifact.repository, resource)
            }
            (kind, _) => self.mirror_key(&artifact.repository, kind),
        }
    }
}

fn object_meta(artifact: &BackupArtifact) -> ObjectMeta {
    let gzipped = artifact.path.extension().is_some_and(|ext| ext == "gz");
    match artifact.kind {
        ArtifactKind::GitMirror | ArtifactKind::WikiMirror => ObjectMeta::ARCHIVE,
        ArtifactKind::MetadataCollection if gzipped => ObjectMeta::GZIPPED_JSON,
        ArtifactKind::MetadataCollection => ObjectMeta::JSON,
    }
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, layout: KeyLayout, retry: RetryPolicy) -> Self {
        Self { store, layout, retry }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Upload `artifact` with retries. The staged file is deleted after the
    /// final attempt, whatever its result.
    pub async fn upload(&self, artifact: BackupArtifact, budget: &TimeBudget) -> Result<UploadedArtifact> {
        let key = self.layout.key_for(&artifact);
        let meta = object_meta(&artifact);

        let result = {
            let store = &self.store;
            let key = &key;
            let path = &artifact.path;
            let meta = &meta;
            self.retry
                .run("upload", budget, || async move { store.put_file(key, path, meta).await })
                .await
        };

        discard(&artifact.path).await;

        match result {
            Ok(()) => {
                info!(
                    repo = %artifact.repository,
                    key = %key,
                    size = %format_bytes(artifact.size_bytes),
                    "Uploaded artifact"
                );
                Ok(UploadedArtifact {
                    kind: artifact.kind,
                    resource: artifact.resource,
                    key,
                    bytes: artifact.size_bytes,
                })
            }
            Err(e) => {
                warn!(repo = %artifact.repository, key = %key, error = %e, "Upload failed");
                Err(BackupError::Storage {
                    message: format!("upload of {} failed: {}", key, e),
                    retryable: false,
                })
            }
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete staged artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn artifact(dir: &Path, kind: ArtifactKind, resource: Option<&str>, file: &str) -> BackupArtifact {
        let path = dir.join(file);
        std::fs::write(&path, b"payload").unwrap();
        BackupArtifact {
            kind,
            repository: "widgets".into(),
            resource: resource.map(str::to_string),
            path,
            size_bytes: 7,
            produced_at: Utc::now(),
        }
    }

    fn budget() -> TimeBudget {
        TimeBudget::new(Duration::from_secs(600), Duration::from_secs(10))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            throttle_retries: 1,
            throttle_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_key_layout() {
        let layout = KeyLayout::new(None, date());
        assert_eq!(
            layout.mirror_key("widgets", ArtifactKind::GitMirror),
            "widgets/git_backup_2024-03-09.tar.gz"
        );
        assert_eq!(
            layout.mirror_key("widgets", ArtifactKind::WikiMirror),
            "widgets/wiki_backup_2024-03-09.tar.gz"
        );
        assert_eq!(
            layout.metadata_key("widgets", "pull_requests"),
            "widgets/metadata/widgets_pull_requests.json"
        );

        let prefixed = KeyLayout::new(Some("/github/acme/"), date());
        assert_eq!(
            prefixed.metadata_key("widgets", "labels"),
            "github/acme/widgets/metadata/widgets_labels.json"
        );
    }

    #[test]
    fn test_object_meta_follows_compression() {
        let tmp = TempDir::new().unwrap();
        let gz = artifact(tmp.path(), ArtifactKind::MetadataCollection, Some("labels"), "l.json.gz");
        assert_eq!(object_meta(&gz), ObjectMeta::GZIPPED_JSON);
        let plain = artifact(tmp.path(), ArtifactKind::MetadataCollection, Some("labels"), "l.json");
        assert_eq!(object_meta(&plain), ObjectMeta::JSON);
        let mirror = artifact(tmp.path(), ArtifactKind::GitMirror, None, "git.tar.gz");
        assert_eq!(object_meta(&mirror), ObjectMeta::ARCHIVE);
    }

    #[tokio::test]
    async fn test_upload_stores_and_deletes_staged_file() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path().join("bucket")));
        let uploader = Uploader::new(store, KeyLayout::new(None, date()), fast_retry());

        let staged = artifact(tmp.path(), ArtifactKind::GitMirror, None, "git.tar.gz");
        let staged_path = staged.path.clone();
        let uploaded = uploader.upload(staged, &budget()).await.unwrap();

        assert_eq!(uploaded.key, "widgets/git_backup_2024-03-09.tar.gz");
        assert!(tmp.path().join("bucket").join(&uploaded.key).exists());
        assert!(!staged_path.exists());
    }

    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_file(&self, _key: &str, _path: &Path, _meta: &ObjectMeta) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(BackupError::Storage { message: "503 SlowDown".into(), retryable: true })
            } else {
                Ok(())
            }
        }

        async fn ensure_container(&self) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore { failures: 2, calls: AtomicU32::new(0) });
        let uploader = Uploader::new(store.clone(), KeyLayout::new(None, date()), fast_retry());

        let staged = artifact(tmp.path(), ArtifactKind::WikiMirror, None, "wiki.tar.gz");
        uploader.upload(staged, &budget()).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_still_delete_staged_file() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore { failures: 10, calls: AtomicU32::new(0) });
        let uploader = Uploader::new(store, KeyLayout::new(None, date()), fast_retry());

        let staged = artifact(tmp.path(), ArtifactKind::GitMirror, None, "git.tar.gz");
        let staged_path = staged.path.clone();
        let err = uploader.upload(staged, &budget()).await.unwrap_err();

        assert!(matches!(err, BackupError::Storage { .. }));
        assert!(!staged_path.exists());
    }
}
