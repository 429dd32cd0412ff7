//! Repository metadata collections (issues, pull requests, releases, ...).

use crate::executor::archive;
use crate::github::{ApiClient, RepositoryRef};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One paginated API resource backed up per repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    /// File name stem and storage key suffix, e.g. `pull_requests`
    pub name: String,

    /// Path below `/repos/{owner}/{repo}/`, query string allowed
    pub path: String,

    /// Field holding the records when the endpoint wraps them in an object
    #[serde(default)]
    pub items_field: Option<String>,
}

impl ResourceType {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            items_field: None,
        }
    }

    pub fn with_items_field(mut self, field: &str) -> Self {
        self.items_field = Some(field.to_string());
        self
    }
}

pub fn default_resource_types() -> Vec<ResourceType> {
    vec![
        ResourceType::new("releases", "releases"),
        ResourceType::new("issues", "issues?state=all"),
        ResourceType::new("pull_requests", "pulls?state=all"),
        ResourceType::new("collaborators", "collaborators"),
        ResourceType::new("labels", "labels"),
        ResourceType::new("milestones", "milestones?state=all"),
        ResourceType::new("commit_comments", "comments"),
        ResourceType::new("forks", "forks"),
        ResourceType::new("actions_workflows", "actions/workflows").with_items_field("workflows"),
        ResourceType::new("actions_secrets", "actions/secrets").with_items_field("secrets"),
        ResourceType::new("webhooks", "hooks"),
        // classic projects; repositories without them answer 404/410
        ResourceType::new("projects", "projects"),
    ]
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_collection(&self, repo: &RepositoryRef, resource: &ResourceType) -> Result<Vec<Value>>;
}

#[async_trait]
impl MetadataSource for ApiClient {
    async fn fetch_collection(&self, repo: &RepositoryRef, resource: &ResourceType) -> Result<Vec<Value>> {
        let path = format!("repos/{}/{}", repo.full_name, resource.path);
        self.paginate(&path, resource.items_field.as_deref()).await
    }
}

/// Write `records` as a JSON array into `dir`, gzip-compressed when
/// `compress` is set (the uncompressed file is removed). Returns the path
/// of the file to upload.
pub async fn write_collection(
    dir: &Path,
    repo: &RepositoryRef,
    resource: &ResourceType,
    records: &[Value],
    compress: bool,
) -> Result<PathBuf> {
    let json_path = dir.join(format!("{}_{}.json", repo.name, resource.name));
    let bytes = serde_json::to_vec_pretty(records)?;
    tokio::fs::write(&json_path, bytes).await?;

    if !compress {
        return Ok(json_path);
    }

    let gz_path = json_path.with_extension("json.gz");
    archive::gzip_file(&json_path, &gz_path).await?;
    tokio::fs::remove_file(&json_path).await?;
    Ok(gz_path)
}
