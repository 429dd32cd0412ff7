//! Run orchestration: enumerate, back up every repository within the time
//! and disk budgets, and assemble the run report.
//!
//! Budget decisions are taken in catalog order. Once one repository is
//! skipped for lack of time, every later one is skipped as well, also when
//! several repositories run concurrently.

use crate::budget::{DiskBudget, TimeBudget};
use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::executor::git::GitCli;
use crate::executor::metadata::MetadataSource;
use crate::executor::staging::StagingArea;
use crate::executor::{BackupWorker, RepositoryBackup, WorkerSettings};
use crate::github::{ApiClient, CatalogFilter, Enumerator, RateBudget, RepositoryLister, RepositoryRef};
use crate::report::{determine_signal, OutcomeStatus, RepositoryOutcome, RunReport, StatusCounts};
use crate::storage::{self, KeyLayout, Uploader};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub organization: String,
    pub work_dir: PathBuf,
    /// Repositories backed up at the same time (1 = sequential)
    pub max_concurrent_repos: usize,
    /// Minimum time a repository is expected to need
    pub min_repo_time: Duration,
    pub disk_factor: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            organization: config.github.organization.clone(),
            work_dir: config.run.work_dir.clone(),
            max_concurrent_repos: config.run.max_concurrent_repos,
            min_repo_time: Duration::from_secs(config.run.min_repo_secs),
            disk_factor: config.run.disk_factor,
        }
    }
}

/// Identity of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub destination: Option<String>,
}

impl RunContext {
    pub fn new(destination: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            destination,
        }
    }
}

enum Admission {
    /// Worker slot and disk reservation, held until the repository is done
    Start(OwnedSemaphorePermit, OwnedSemaphorePermit),
    OutOfBudget,
}

pub struct Orchestrator {
    lister: Arc<dyn RepositoryLister>,
    worker: Arc<dyn RepositoryBackup>,
    time: Arc<TimeBudget>,
    disk: DiskBudget,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        lister: Arc<dyn RepositoryLister>,
        worker: Arc<dyn RepositoryBackup>,
        time: Arc<TimeBudget>,
        disk: DiskBudget,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            lister,
            worker,
            time,
            disk,
            settings,
        }
    }

    /// Wait for a worker slot and the repository's disk reservation, then
    /// check the time budget again.
    async fn admit(&self, pool: &Arc<Semaphore>, repo: &RepositoryRef) -> Result<Admission> {
        let cancel = self.time.cancellation_token();

        let worker_slot = tokio::select! {
            slot = pool.clone().acquire_owned() => slot
                .map_err(|e| BackupError::Artifact(format!("worker pool closed: {}", e)))?,
            _ = cancel.cancelled() => return Ok(Admission::OutOfBudget),
        };

        let estimate = self.disk.estimate_mib(repo, self.settings.disk_factor);
        let disk = tokio::select! {
            reserved = self.disk.reserve(estimate) => reserved?,
            _ = cancel.cancelled() => return Ok(Admission::OutOfBudget),
        };

        if !self.time.should_start_next(self.settings.min_repo_time) {
            return Ok(Admission::OutOfBudget);
        }
        Ok(Admission::Start(worker_slot, disk))
    }

    pub async fn run(&self, context: RunContext) -> RunReport {
        let organization = self.settings.organization.as_str();
        info!(
            run_id = %context.run_id,
            org = organization,
            time_left = %format_duration(self.time.remaining()),
            "Starting backup run"
        );

        let catalog = match self.lister.list_repositories(organization).await {
            Ok(catalog) => catalog,
            Err(e) => {
                error!(org = organization, error = %e, "Cannot enumerate repositories");
                return RunReport::fatal(&context.run_id, organization, context.started_at, e.to_string());
            }
        };

        let pool = Arc::new(Semaphore::new(self.settings.max_concurrent_repos.max(1)));
        let mut outcomes: Vec<Option<RepositoryOutcome>> = vec![None; catalog.len()];
        let mut handles = Vec::new();
        let mut truncated = false;

        for (index, repo) in catalog.repositories.iter().enumerate() {
            let admission = if self.time.should_start_next(self.settings.min_repo_time) {
                match self.admit(&pool, repo).await {
                    Ok(admission) => admission,
                    Err(e) => {
                        outcomes[index] = Some(RepositoryOutcome::failed(&repo.name, e.to_string()));
                        continue;
                    }
                }
            } else {
                Admission::OutOfBudget
            };

            let permits = match admission {
                Admission::Start(worker_slot, disk) => (worker_slot, disk),
                Admission::OutOfBudget => {
                    let skipped = catalog.len() - index;
                    warn!(
                        repo = %repo.name,
                        skipped,
                        time_left = %format_duration(self.time.remaining()),
                        "Time budget exhausted, skipping remaining repositories"
                    );
                    for (slot, later) in outcomes[index..].iter_mut().zip(&catalog.repositories[index..]) {
                        *slot = Some(RepositoryOutcome::skipped_budget(&later.name));
                    }
                    truncated = true;
                    break;
                }
            };

            let worker = self.worker.clone();
            let time = self.time.clone();
            let work_dir = self.settings.work_dir.clone();
            let repo = repo.clone();
            handles.push((
                index,
                repo.name.clone(),
                tokio::spawn(async move {
                    let _permits = permits;
                    match StagingArea::create(&work_dir, &repo.name).await {
                        Ok(staging) => {
                            let outcome = worker.backup(&repo, &staging, &time).await;
                            if let Err(e) = staging.reclaim().await {
                                warn!(repo = %repo.name, error = %e, "Failed to remove staging area");
                            }
                            outcome
                        }
                        Err(e) => RepositoryOutcome::failed(&repo.name, format!("staging: {}", e)),
                    }
                }),
            ));
        }

        for (index, name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(repo = %name, error = %e, "Repository task panicked");
                    RepositoryOutcome::failed(&name, format!("worker task failed: {}", e))
                }
            };
            outcomes[index] = Some(outcome);
        }

        let outcomes: Vec<RepositoryOutcome> = outcomes
            .into_iter()
            .zip(&catalog.repositories)
            .map(|(outcome, repo)| outcome.unwrap_or_else(|| RepositoryOutcome::skipped_budget(&repo.name)))
            .collect();

        for outcome in outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed) {
            error!(repo = %outcome.repository, errors = ?outcome.errors, "Repository backup failed");
        }

        let counts = StatusCounts::tally(&outcomes);
        let uploaded_bytes = outcomes.iter().map(|o| o.uploaded_bytes()).sum();
        let signal = determine_signal(&outcomes, catalog.partial, truncated);
        info!(
            run_id = %context.run_id,
            success = counts.success,
            partial = counts.partial,
            failed = counts.failed,
            skipped_budget = counts.skipped_budget,
            uploaded = %format_bytes(uploaded_bytes),
            elapsed = %format_duration(self.time.elapsed()),
            ?signal,
            "Backup run finished"
        );

        RunReport {
            run_id: context.run_id,
            organization: organization.to_string(),
            run_date: context.started_at.date_naive(),
            started_at: context.started_at,
            finished_at: Utc::now(),
            destination: context.destination,
            catalog_size: catalog.len(),
            catalog_partial: catalog.partial,
            truncated_by_budget: truncated,
            outcomes,
            counts,
            uploaded_bytes,
            signal,
            fatal_error: None,
        }
    }
}

/// Wire the production components from configuration and credentials.
async fn build(
    config: &Config,
    provider: &dyn CredentialProvider,
    time: Arc<TimeBudget>,
    context: &mut RunContext,
) -> Result<Orchestrator> {
    config.validate()?;
    let credentials = provider.get_credentials().await?;

    let store = storage::store_from_config(&config.storage, credentials.storage.as_ref()).await?;
    if config.storage.ensure_bucket || config.storage.backend == crate::config::StorageBackend::Local {
        store.ensure_container().await?;
    }
    context.destination = Some(store.describe());

    let rate = Arc::new(RateBudget::new(config.github.low_water_mark));
    let client = Arc::new(ApiClient::new(
        &config.github,
        &config.retry,
        credentials.access_token.clone(),
        rate,
        time.clone(),
    )?);

    let filter = CatalogFilter {
        include_archived: config.github.include_archived,
        include_forks: config.github.include_forks,
        only: config.github.only.clone(),
    };
    let lister = Arc::new(Enumerator::new(client.clone(), filter));

    let layout = KeyLayout::new(config.storage.prefix.as_deref(), context.started_at.date_naive());
    let uploader = Arc::new(Uploader::new(store, layout, RetryPolicy::from_config(&config.retry)));
    let metadata: Arc<dyn MetadataSource> = client;
    let worker = Arc::new(BackupWorker::new(
        Arc::new(GitCli::new(&credentials.access_token)),
        metadata,
        uploader,
        WorkerSettings::from_config(config),
    ));

    Ok(Orchestrator::new(
        lister,
        worker,
        time,
        DiskBudget::new(config.run.disk_budget_mb),
        OrchestratorSettings::from_config(config),
    ))
}

/// Run a whole backup from configuration. Always returns a report; startup
/// failures (configuration, credentials, storage setup) produce a fatal one.
pub async fn run_from_config(
    config: &Config,
    provider: &dyn CredentialProvider,
    time: Arc<TimeBudget>,
) -> RunReport {
    let mut context = RunContext::new(None);
    match build(config, provider, time, &mut context).await {
        Ok(orchestrator) => orchestrator.run(context).await,
        Err(e) => {
            error!(org = %config.github.organization, error = %e, "Backup run cannot start");
            RunReport::fatal(
                &context.run_id,
                &config.github.organization,
                context.started_at,
                e.to_string(),
            )
        }
    }
}
