//! Run report: per-repository outcomes and the overall run signal.

use crate::executor::ArtifactKind;
use crate::utils::errors::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failed,
    SkippedBudget,
}

/// One object written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedArtifact {
    pub kind: ArtifactKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub key: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryOutcome {
    pub repository: String,
    pub status: OutcomeStatus,
    pub artifacts: Vec<UploadedArtifact>,
    /// Units that do not exist for this repository (disabled feature, no wiki)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip)]
    succeeded_units: usize,
    #[serde(skip)]
    failed_units: usize,
}

impl RepositoryOutcome {
    /// Start recording a repository; the status is settled by [`finish`].
    ///
    /// [`finish`]: RepositoryOutcome::finish
    pub fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            status: OutcomeStatus::Success,
            artifacts: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
            succeeded_units: 0,
            failed_units: 0,
        }
    }

    pub fn skipped_budget(repository: &str) -> Self {
        Self {
            status: OutcomeStatus::SkippedBudget,
            ..Self::new(repository)
        }
    }

    pub fn failed(repository: &str, error: impl Into<String>) -> Self {
        let mut outcome = Self::new(repository);
        outcome.record_failure(error);
        outcome.status = OutcomeStatus::Failed;
        outcome
    }

    pub fn record_upload(&mut self, artifact: UploadedArtifact) {
        self.succeeded_units += 1;
        self.artifacts.push(artifact);
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed_units += 1;
        self.errors.push(error.into());
    }

    pub fn record_skip(&mut self, unit: impl Into<String>) {
        self.skipped.push(unit.into());
    }

    /// Settle the status: all attempted units fine is `success`, a mix is
    /// `partial`, nothing stored is `failed`.
    pub fn finish(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self.status = match (self.succeeded_units, self.failed_units) {
            (_, 0) => OutcomeStatus::Success,
            (0, _) => OutcomeStatus::Failed,
            _ => OutcomeStatus::Partial,
        };
        self
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.bytes).sum()
    }

    pub fn has_artifact(&self, kind: ArtifactKind) -> bool {
        self.artifacts.iter().any(|a| a.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSignal {
    Success,
    SuccessWithWarnings,
    Failed,
    Fatal,
}

impl RunSignal {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunSignal::Success => 0,
            RunSignal::SuccessWithWarnings => 1,
            RunSignal::Failed => 2,
            RunSignal::Fatal => 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped_budget: usize,
}

impl StatusCounts {
    pub fn tally(outcomes: &[RepositoryOutcome]) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Success => counts.success += 1,
                OutcomeStatus::Partial => counts.partial += 1,
                OutcomeStatus::Failed => counts.failed += 1,
                OutcomeStatus::SkippedBudget => counts.skipped_budget += 1,
            }
        }
        counts
    }
}

/// Overall signal of a run that got past startup.
pub fn determine_signal(outcomes: &[RepositoryOutcome], catalog_partial: bool, truncated: bool) -> RunSignal {
    let counts = StatusCounts::tally(outcomes);
    if counts.failed > 0 {
        RunSignal::Failed
    } else if counts.partial > 0 || counts.skipped_budget > 0 || catalog_partial || truncated {
        RunSignal::SuccessWithWarnings
    } else {
        RunSignal::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub organization: String,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub destination: Option<String>,
    pub catalog_size: usize,
    pub catalog_partial: bool,
    pub truncated_by_budget: bool,
    /// Catalog order
    pub outcomes: Vec<RepositoryOutcome>,
    pub counts: StatusCounts,
    pub uploaded_bytes: u64,
    pub signal: RunSignal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RunReport {
    /// Report of a run that could not start: no repository was attempted.
    pub fn fatal(
        run_id: &str,
        organization: &str,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            organization: organization.to_string(),
            run_date: started_at.date_naive(),
            started_at,
            finished_at: Utc::now(),
            destination: None,
            catalog_size: 0,
            catalog_partial: false,
            truncated_by_budget: false,
            outcomes: Vec::new(),
            counts: StatusCounts::default(),
            uploaded_bytes: 0,
            signal: RunSignal::Fatal,
            fatal_error: Some(error.into()),
        }
    }

    pub fn get(&self, repository: &str) -> Option<&RepositoryOutcome> {
        self.outcomes.iter().find(|o| o.repository == repository)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
