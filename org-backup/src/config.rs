//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file, then applies environment variable
//! overrides. Every section has defaults, so a file only needs the values
//! that differ (typically the organization and the bucket).

use crate::executor::metadata::{default_resource_types, ResourceType};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Organization whose repositories are backed up
    #[serde(default)]
    pub organization: String,

    /// REST API base URL (GitHub Enterprise installs differ)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Page size for every paginated listing (max 100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Below this many remaining calls, wait for the rate window to reset
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: u32,

    #[serde(default = "default_true")]
    pub include_archived: bool,

    #[serde(default = "default_true")]
    pub include_forks: bool,

    /// Restrict the run to these repository names (empty = all)
    #[serde(default)]
    pub only: Vec<String>,

    /// Metadata collections fetched for every repository
    #[serde(default = "default_resource_types")]
    pub resources: Vec<ResourceType>,

    /// Store metadata gzip-compressed (Content-Encoding: gzip)
    #[serde(default = "default_true")]
    pub compress_metadata: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Bucket name (S3) or a label for the local root
    #[serde(default)]
    pub bucket: String,

    /// Region override; falls back to the credential's region, then us-east-1
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub path_style: bool,

    /// Prepended to every key as `{prefix}/...`
    #[serde(default)]
    pub prefix: Option<String>,

    /// Root directory for the local backend
    #[serde(default)]
    pub local_root: Option<PathBuf>,

    /// Check the bucket at startup and create it when missing
    #[serde(default)]
    pub ensure_bucket: bool,

    /// Limit for one storage request attempt, sized for the largest archive
    #[serde(default = "default_storage_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_storage_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Env,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credential_source")]
    pub source: CredentialSource,

    /// JSON secret document (GITHUB_TOKEN, AWS_ACCESS_KEY_ID, ...)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Writable working directory (staging area and mirror cache)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// External execution ceiling
    #[serde(default = "default_time_ceiling_secs")]
    pub time_ceiling_secs: u64,

    /// Reserved for the final upload flush and the report
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,

    /// Minimum time a repository is expected to need
    #[serde(default = "default_min_repo_secs")]
    pub min_repo_secs: u64,

    /// Share of the usable time one clone or fetch may take
    #[serde(default = "default_clone_fraction")]
    pub clone_fraction: f64,

    #[serde(default = "default_max_concurrent_repos")]
    pub max_concurrent_repos: usize,

    /// Local disk available to staging, in MiB
    #[serde(default = "default_disk_budget_mb")]
    pub disk_budget_mb: u32,

    /// Reserved disk per repository = size * factor
    #[serde(default = "default_disk_factor")]
    pub disk_factor: u32,

    /// Keep git mirrors between runs for incremental fetches
    #[serde(default)]
    pub keep_mirrors: bool,

    /// Write the final run report here as well as to stdout
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Per-request timeout under the retry policy
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_throttle_jitter_ms")]
    pub throttle_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_per_page() -> u32 {
    100
}

fn default_low_water_mark() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

fn default_backend() -> StorageBackend {
    StorageBackend::S3
}

fn default_storage_request_timeout_secs() -> u64 {
    300
}

fn default_storage_connect_timeout_secs() -> u64 {
    10
}

fn default_credential_source() -> CredentialSource {
    CredentialSource::Env
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/backup")
}

fn default_time_ceiling_secs() -> u64 {
    900
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_min_repo_secs() -> u64 {
    20
}

fn default_clone_fraction() -> f64 {
    0.5
}

fn default_max_concurrent_repos() -> usize {
    1
}

fn default_disk_budget_mb() -> u32 {
    10 * 1024
}

fn default_disk_factor() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_throttle_jitter_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            organization: String::new(),
            api_url: default_api_url(),
            per_page: default_per_page(),
            low_water_mark: default_low_water_mark(),
            include_archived: true,
            include_forks: true,
            only: Vec::new(),
            resources: default_resource_types(),
            compress_metadata: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: String::new(),
            region: None,
            endpoint: None,
            path_style: false,
            prefix: None,
            local_root: None,
            ensure_bucket: false,
            request_timeout_secs: default_storage_request_timeout_secs(),
            connect_timeout_secs: default_storage_connect_timeout_secs(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            source: default_credential_source(),
            secret_file: None,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            time_ceiling_secs: default_time_ceiling_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            min_repo_secs: default_min_repo_secs(),
            clone_fraction: default_clone_fraction(),
            max_concurrent_repos: default_max_concurrent_repos(),
            disk_budget_mb: default_disk_budget_mb(),
            disk_factor: default_disk_factor(),
            keep_mirrors: false,
            report_path: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            throttle_jitter_ms: default_throttle_jitter_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(org) = get("GITHUB_ORG") {
            self.github.organization = org;
        }
        if let Some(url) = get("GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(bucket) = get("S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(endpoint) = get("S3_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(region) = get("S3_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(file) = get("BACKUP_SECRET_FILE") {
            self.credentials.source = CredentialSource::File;
            self.credentials.secret_file = Some(PathBuf::from(file));
        }
        if let Some(dir) = get("BACKUP_WORK_DIR") {
            self.run.work_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("BACKUP_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
            self.run.time_ceiling_secs = secs;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.github.organization.trim().is_empty() {
            return Err(BackupError::Config(
                "github.organization (GITHUB_ORG) is required".into(),
            ));
        }
        if !(1..=100).contains(&self.github.per_page) {
            return Err(BackupError::Config("github.per_page must be within 1..=100".into()));
        }
        match self.storage.backend {
            StorageBackend::S3 if self.storage.bucket.trim().is_empty() => {
                return Err(BackupError::Config("storage.bucket (S3_BUCKET) is required".into()));
            }
            StorageBackend::Local if self.storage.local_root.is_none() => {
                return Err(BackupError::Config(
                    "storage.local_root is required for the local backend".into(),
                ));
            }
            _ => {}
        }
        if let Some(ref endpoint) = self.storage.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(BackupError::Config(
                    "storage.endpoint must start with http:// or https://".into(),
                ));
            }
        }
        if self.storage.request_timeout_secs == 0 || self.storage.connect_timeout_secs == 0 {
            return Err(BackupError::Config("storage timeouts must be at least 1 second".into()));
        }
        if self.credentials.source == CredentialSource::File && self.credentials.secret_file.is_none() {
            return Err(BackupError::Config(
                "credentials.secret_file is required when source = \"file\"".into(),
            ));
        }
        if !(self.run.clone_fraction > 0.0 && self.run.clone_fraction <= 1.0) {
            return Err(BackupError::Config("run.clone_fraction must be within (0, 1]".into()));
        }
        if !(1..=4).contains(&self.run.max_concurrent_repos) {
            return Err(BackupError::Config("run.max_concurrent_repos must be within 1..=4".into()));
        }
        if self.run.safety_margin_secs >= self.run.time_ceiling_secs {
            return Err(BackupError::Config(
                "run.safety_margin_secs must be smaller than run.time_ceiling_secs".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BackupError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.github.resources.iter().any(|r| r.name.trim().is_empty()) {
            return Err(BackupError::Config("every github.resources entry needs a name".into()));
        }
        Ok(())
    }
}
