//! Repository backup worker.
//!
//! Backs up one repository as independent artifact classes:
//! - git mirror (incremental fetch into a cached mirror when possible)
//! - one metadata collection per configured resource type
//! - wiki mirror, when the repository has a wiki
//!
//! Each class is compressed, uploaded and reclaimed from staging before the
//! next one starts. A failing class never stops the others.

pub mod archive;
pub mod git;
pub mod metadata;
pub mod staging;

use crate::budget::TimeBudget;
use crate::config::Config;
use crate::github::RepositoryRef;
use crate::report::{RepositoryOutcome, UploadedArtifact};
use crate::storage::Uploader;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git::GitTransport;
use metadata::{MetadataSource, ResourceType};
use serde::{Deserialize, Serialize};
use staging::{remove_if_exists, StagingArea};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    GitMirror,
    WikiMirror,
    MetadataCollection,
}

impl ArtifactKind {
    /// Stem used in staging directories and storage keys
    pub fn key_stem(&self) -> &'static str {
        match self {
            ArtifactKind::GitMirror => "git",
            ArtifactKind::WikiMirror => "wiki",
            ArtifactKind::MetadataCollection => "metadata",
        }
    }
}

/// A compressed file in staging, waiting for upload.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub kind: ArtifactKind,
    pub repository: String,
    /// Resource type name, for metadata collections
    pub resource: Option<String>,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Fraction of the usable time a single clone or fetch may take
    pub clone_fraction: f64,
    /// Keep bare mirrors between runs for incremental fetches
    pub keep_mirrors: bool,
    pub mirror_root: PathBuf,
    pub resources: Vec<ResourceType>,
    pub compress_metadata: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            clone_fraction: config.run.clone_fraction,
            keep_mirrors: config.run.keep_mirrors,
            mirror_root: config.run.work_dir.join("mirrors"),
            resources: config.github.resources.clone(),
            compress_metadata: config.github.compress_metadata,
        }
    }
}

#[async_trait]
pub trait RepositoryBackup: Send + Sync {
    /// Back up every artifact class of `repo`. Never fails: problems are
    /// recorded in the returned outcome.
    async fn backup(&self, repo: &RepositoryRef, staging: &StagingArea, budget: &TimeBudget) -> RepositoryOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorSync {
    Incremental,
    Full,
}

pub struct BackupWorker {
    git: Arc<dyn GitTransport>,
    metadata: Arc<dyn MetadataSource>,
    uploader: Arc<Uploader>,
    settings: WorkerSettings,
}

impl BackupWorker {
    pub fn new(
        git: Arc<dyn GitTransport>,
        metadata: Arc<dyn MetadataSource>,
        uploader: Arc<Uploader>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            git,
            metadata,
            uploader,
            settings,
        }
    }

    fn mirror_dir(&self, repo: &RepositoryRef, kind: ArtifactKind) -> PathBuf {
        let name = match kind {
            ArtifactKind::WikiMirror => format!("{}.wiki.git", repo.name),
            _ => format!("{}.git", repo.name),
        };
        self.settings.mirror_root.join(name)
    }

    /// Bring the mirror at `dir` up to date: incremental fetch into a valid
    /// cached mirror, full mirror clone on any doubt.
    async fn sync_mirror(&self, url: &str, dir: &Path, budget: &TimeBudget) -> Result<MirrorSync> {
        if self.git.is_valid_mirror(dir).await {
            match self.git.update_mirror(dir, budget.sub_timeout(self.settings.clone_fraction)).await {
                Ok(()) => return Ok(MirrorSync::Incremental),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Incremental fetch failed, falling back to full mirror clone");
                }
            }
        }

        remove_if_exists(dir).await?;
        let cloned = self
            .git
            .mirror_clone(url, dir, budget.sub_timeout(self.settings.clone_fraction))
            .await;
        if cloned.is_err() {
            // a half-written clone must not pass as a cached mirror next time
            let _ = remove_if_exists(dir).await;
        }
        cloned.map(|_| MirrorSync::Full)
    }

    async fn mirror_artifact(
        &self,
        repo: &RepositoryRef,
        kind: ArtifactKind,
        url: &str,
        staging: &StagingArea,
        budget: &TimeBudget,
    ) -> Result<UploadedArtifact> {
        let mirror_dir = self.mirror_dir(repo, kind);
        let started = Instant::now();
        let mode = self.sync_mirror(url, &mirror_dir, budget).await?;
        debug!(
            repo = %repo.name,
            kind = kind.key_stem(),
            ?mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Mirror synchronized"
        );

        let class_dir = staging.class_dir(kind.key_stem()).await?;
        let archive_path = archive::archive_path(&class_dir, &format!("{}_backup", kind.key_stem()));
        let root_name = mirror_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archived = archive::tar_gz_dir(&mirror_dir, &archive_path, &root_name).await;
        if !self.settings.keep_mirrors {
            remove_if_exists(&mirror_dir).await?;
        }
        let size_bytes = archived?;

        let artifact = BackupArtifact {
            kind,
            repository: repo.name.clone(),
            resource: None,
            path: archive_path,
            size_bytes,
            produced_at: Utc::now(),
        };
        self.uploader.upload(artifact, budget).await
    }

    async fn backup_mirror(
        &self,
        repo: &RepositoryRef,
        kind: ArtifactKind,
        url: &str,
        staging: &StagingArea,
        budget: &TimeBudget,
    ) -> Result<UploadedArtifact> {
        let result = self.mirror_artifact(repo, kind, url, staging, budget).await;

        if !self.settings.keep_mirrors {
            if let Err(e) = remove_if_exists(&self.mirror_dir(repo, kind)).await {
                warn!(repo = %repo.name, error = %e, "Failed to remove mirror");
            }
        }
        if let Err(e) = staging.reclaim_class(kind.key_stem()).await {
            warn!(repo = %repo.name, error = %e, "Failed to reclaim staging");
        }
        result
    }

    async fn backup_collection(
        &self,
        repo: &RepositoryRef,
        resource: &ResourceType,
        dir: &Path,
        budget: &TimeBudget,
    ) -> Result<UploadedArtifact> {
        let records = self.metadata.fetch_collection(repo, resource).await?;
        let path = metadata::write_collection(dir, repo, resource, &records, self.settings.compress_metadata).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        debug!(repo = %repo.name, resource = %resource.name, records = records.len(), "Metadata collection written");

        let artifact = BackupArtifact {
            kind: ArtifactKind::MetadataCollection,
            repository: repo.name.clone(),
            resource: Some(resource.name.clone()),
            path,
            size_bytes,
            produced_at: Utc::now(),
        };
        self.uploader.upload(artifact, budget).await
    }

    async fn backup_metadata(
        &self,
        repo: &RepositoryRef,
        staging: &StagingArea,
        budget: &TimeBudget,
        outcome: &mut RepositoryOutcome,
    ) {
        let class = ArtifactKind::MetadataCollection.key_stem();
        let dir = match staging.class_dir(class).await {
            Ok(dir) => dir,
            Err(e) => {
                for resource in &self.settings.resources {
                    outcome.record_failure(format!("metadata {}: {}", resource.name, e));
                }
                return;
            }
        };

        for resource in &self.settings.resources {
            if budget.is_exhausted() {
                outcome.record_failure(format!("metadata {}: budget exhausted before start", resource.name));
                continue;
            }
            match self.backup_collection(repo, resource, &dir, budget).await {
                Ok(uploaded) => outcome.record_upload(uploaded),
                Err(e) if e.is_not_found() => {
                    debug!(repo = %repo.name, resource = %resource.name, "Resource not available, skipping");
                    outcome.record_skip(format!("metadata {}", resource.name));
                }
                Err(e) => {
                    warn!(repo = %repo.name, resource = %resource.name, error = %e, "Metadata collection failed");
                    outcome.record_failure(format!("metadata {}: {}", resource.name, e));
                }
            }
        }

        if let Err(e) = staging.reclaim_class(class).await {
            warn!(repo = %repo.name, error = %e, "Failed to reclaim staging");
        }
    }
}

#[async_trait]
impl RepositoryBackup for BackupWorker {
    async fn backup(&self, repo: &RepositoryRef, staging: &StagingArea, budget: &TimeBudget) -> RepositoryOutcome {
        let started = Instant::now();
        let mut outcome = RepositoryOutcome::new(&repo.name);
        info!(repo = %repo.name, size_kib = repo.size_kib, has_wiki = repo.has_wiki, "Backing up repository");

        if budget.is_exhausted() {
            outcome.record_failure("git mirror: budget exhausted before start");
        } else {
            match self
                .backup_mirror(repo, ArtifactKind::GitMirror, &repo.clone_url, staging, budget)
                .await
            {
                Ok(uploaded) => outcome.record_upload(uploaded),
                Err(e) => {
                    warn!(repo = %repo.name, error = %e, "Git mirror failed");
                    outcome.record_failure(format!("git mirror: {}", e));
                }
            }
        }

        self.backup_metadata(repo, staging, budget, &mut outcome).await;

        if repo.has_wiki {
            if budget.is_exhausted() {
                outcome.record_failure("wiki mirror: budget exhausted before start");
            } else {
                match self
                    .backup_mirror(repo, ArtifactKind::WikiMirror, &repo.wiki_url(), staging, budget)
                    .await
                {
                    Ok(uploaded) => outcome.record_upload(uploaded),
                    Err(e) if e.is_not_found() => {
                        debug!(repo = %repo.name, "Wiki enabled but never created, skipping");
                        outcome.record_skip("wiki mirror");
                    }
                    Err(e) => {
                        warn!(repo = %repo.name, error = %e, "Wiki mirror failed");
                        outcome.record_failure(format!("wiki mirror: {}", e));
                    }
                }
            }
        }

        let outcome = outcome.finish(started.elapsed());
        info!(
            repo = %repo.name,
            status = ?outcome.status,
            artifacts = outcome.artifacts.len(),
            errors = outcome.errors.len(),
            duration_ms = outcome.duration_ms,
            "Repository done"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::OutcomeStatus;
    use crate::storage::{KeyLayout, LocalStore, ObjectMeta, ObjectStore};
    use crate::utils::errors::BackupError;
    use crate::utils::retry::RetryPolicy;
    use chrono::NaiveDate;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a fake bare repository; fails for URLs containing `fail`,
    /// reports wikis as missing.
    #[derive(Default)]
    struct FakeGit {
        fetches: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl GitTransport for FakeGit {
        async fn mirror_clone(&self, url: &str, dest: &Path, _timeout: Duration) -> Result<()> {
            if url.contains(".wiki.git") {
                return Err(BackupError::NotFound("wiki".into()));
            }
            if url.contains("fail") {
                return Err(BackupError::Git("clone failed".into()));
            }
            std::fs::create_dir_all(dest.join("refs"))?;
            std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n")?;
            Ok(())
        }

        async fn update_mirror(&self, dir: &Path, _timeout: Duration) -> Result<()> {
            self.fetches.lock().unwrap().push(dir.to_path_buf());
            Ok(())
        }

        async fn is_valid_mirror(&self, dir: &Path) -> bool {
            dir.join("HEAD").exists()
        }
    }

    struct FakeMetadata;

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn fetch_collection(&self, _repo: &RepositoryRef, resource: &ResourceType) -> Result<Vec<Value>> {
            match resource.name.as_str() {
                "webhooks" => Err(BackupError::Permanent { status: 403, message: "admin only".into() }),
                "forks" => Err(BackupError::Permanent { status: 404, message: "Not Found".into() }),
                _ => Ok(vec![serde_json::json!({"id": 1})]),
            }
        }
    }

    /// Local bucket that refuses every key containing `reject`.
    struct RejectingStore {
        inner: LocalStore,
        reject: &'static str,
    }

    #[async_trait]
    impl ObjectStore for RejectingStore {
        async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<()> {
            if key.contains(self.reject) {
                return Err(BackupError::Storage { message: "AccessDenied".into(), retryable: false });
            }
            self.inner.put_file(key, path, meta).await
        }

        async fn ensure_container(&self) -> Result<()> {
            self.inner.ensure_container().await
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    fn worker(tmp: &TempDir, keep_mirrors: bool, resources: Vec<ResourceType>) -> (BackupWorker, Arc<FakeGit>) {
        let store = Arc::new(LocalStore::new(tmp.path().join("bucket")));
        worker_with_store(tmp, keep_mirrors, resources, store)
    }

    fn worker_with_store(
        tmp: &TempDir,
        keep_mirrors: bool,
        resources: Vec<ResourceType>,
        store: Arc<dyn ObjectStore>,
    ) -> (BackupWorker, Arc<FakeGit>) {
        let git = Arc::new(FakeGit::default());
        let layout = KeyLayout::new(None, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let uploader = Arc::new(Uploader::new(store, layout, RetryPolicy::default()));
        let settings = WorkerSettings {
            clone_fraction: 0.5,
            keep_mirrors,
            mirror_root: tmp.path().join("work/mirrors"),
            resources,
            compress_metadata: true,
        };
        (BackupWorker::new(git.clone(), Arc::new(FakeMetadata), uploader, settings), git)
    }

    fn budget() -> TimeBudget {
        TimeBudget::new(Duration::from_secs(600), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_full_backup_uploads_every_class() {
        let tmp = TempDir::new().unwrap();
        let (worker, _) = worker(&tmp, false, vec![ResourceType::new("labels", "labels")]);
        let repo = RepositoryRef::for_test("widgets", 10);
        let staging = StagingArea::create(&tmp.path().join("work"), "widgets").await.unwrap();

        let outcome = worker.backup(&repo, &staging, &budget()).await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.artifacts.len(), 2);
        let bucket = tmp.path().join("bucket");
        assert!(bucket.join("widgets/git_backup_2024-01-02.tar.gz").exists());
        assert!(bucket.join("widgets/metadata/widgets_labels.json").exists());
        assert_eq!(staging.usage_bytes(), 0);
        assert!(!tmp.path().join("work/mirrors/widgets.git").exists());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_class() {
        let tmp = TempDir::new().unwrap();
        let resources = vec![
            ResourceType::new("labels", "labels"),
            ResourceType::new("webhooks", "hooks"),
            ResourceType::new("forks", "forks"),
        ];
        let (worker, _) = worker(&tmp, false, resources);
        let repo = RepositoryRef::new("acme/fail-me", "https://github.com/acme/fail-me.git").with_wiki(true);
        let staging = StagingArea::create(&tmp.path().join("work"), "fail-me").await.unwrap();

        let outcome = worker.backup(&repo, &staging, &budget()).await;

        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().any(|e| e.starts_with("git mirror")));
        assert!(outcome.errors.iter().any(|e| e.starts_with("metadata webhooks")));
        assert!(outcome.skipped.contains(&"metadata forks".to_string()));
        assert!(outcome.skipped.contains(&"wiki mirror".to_string()));
    }

    #[tokio::test]
    async fn test_failed_upload_downgrades_to_partial_and_continues() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RejectingStore {
            inner: LocalStore::new(tmp.path().join("bucket")),
            reject: "_labels",
        });
        let resources = vec![
            ResourceType::new("labels", "labels"),
            ResourceType::new("issues", "issues?state=all"),
        ];
        let (worker, _) = worker_with_store(&tmp, false, resources, store);
        let repo = RepositoryRef::for_test("widgets", 10);
        let staging = StagingArea::create(&tmp.path().join("work"), "widgets").await.unwrap();

        let outcome = worker.backup(&repo, &staging, &budget()).await;

        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.artifacts.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("metadata labels"));
        let bucket = tmp.path().join("bucket");
        assert!(bucket.join("widgets/git_backup_2024-01-02.tar.gz").exists());
        assert!(bucket.join("widgets/metadata/widgets_issues.json").exists());
        assert!(!bucket.join("widgets/metadata/widgets_labels.json").exists());
        assert_eq!(staging.usage_bytes(), 0);
    }

    #[tokio::test]
    async fn test_kept_mirror_is_fetched_incrementally() {
        let tmp = TempDir::new().unwrap();
        let (worker, git) = worker(&tmp, true, Vec::new());
        let repo = RepositoryRef::for_test("widgets", 10);
        let work = tmp.path().join("work");

        let staging = StagingArea::create(&work, "widgets").await.unwrap();
        worker.backup(&repo, &staging, &budget()).await;
        drop(staging);
        assert!(work.join("mirrors/widgets.git/HEAD").exists());
        assert!(git.fetches.lock().unwrap().is_empty());

        let staging = StagingArea::create(&work, "widgets").await.unwrap();
        let outcome = worker.backup(&repo, &staging, &budget()).await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(git.fetches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_starts_nothing() {
        let tmp = TempDir::new().unwrap();
        let (worker, _) = worker(&tmp, false, vec![ResourceType::new("labels", "labels")]);
        let repo = RepositoryRef::for_test("widgets", 10);
        let staging = StagingArea::create(&tmp.path().join("work"), "widgets").await.unwrap();
        let budget = budget();
        budget.cancel();

        let outcome = worker.backup(&repo, &staging, &budget).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.artifacts.is_empty());
        assert!(!tmp.path().join("bucket/widgets").exists());
    }
}
