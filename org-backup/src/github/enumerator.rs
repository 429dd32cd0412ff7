//! Organization repository listing.

use crate::github::client::ApiClient;
use crate::github::models::{CatalogFilter, OrganizationCatalog, RepositoryRef};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait RepositoryLister: Send + Sync {
    async fn list_repositories(&self, organization: &str) -> Result<OrganizationCatalog>;
}

pub struct Enumerator {
    client: Arc<ApiClient>,
    filter: CatalogFilter,
}

impl Enumerator {
    pub fn new(client: Arc<ApiClient>, filter: CatalogFilter) -> Self {
        Self { client, filter }
    }

    async fn fetch_page(&self, url: &str) -> Result<(Vec<RepositoryRef>, Option<String>)> {
        let page = self.client.get_page(url).await?;
        let next = page.next.clone();
        let repos = page
            .into_records(None)?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<RepositoryRef>, _>>()?;
        Ok((repos, next))
    }
}

fn first_page_error(organization: &str, err: BackupError) -> BackupError {
    let reason = match &err {
        BackupError::Permanent { status: 404, .. } => {
            format!("organization '{}' not found or no access", organization)
        }
        BackupError::Permanent { status: 403, .. } => {
            format!("access to '{}' forbidden, check token permissions", organization)
        }
        other => format!("cannot list repositories of '{}': {}", organization, other),
    };
    BackupError::Enumeration(reason)
}

#[async_trait]
impl RepositoryLister for Enumerator {
    async fn list_repositories(&self, organization: &str) -> Result<OrganizationCatalog> {
        let per_page = self.client.per_page() as usize;
        let mut url = self.client.endpoint(&format!("orgs/{}/repos?type=all", organization));
        let mut listed = Vec::new();
        let mut partial = false;
        let mut page_number = 1u32;

        loop {
            let (repos, next) = match self.fetch_page(&url).await {
                Ok(page) => page,
                Err(err) if page_number == 1 => return Err(first_page_error(organization, err)),
                Err(err) => {
                    warn!(
                        org = organization,
                        page = page_number,
                        listed = listed.len(),
                        error = %err,
                        "Repository listing failed mid-way, continuing with a partial catalog"
                    );
                    partial = true;
                    break;
                }
            };

            let count = repos.len();
            listed.extend(repos);

            match next {
                Some(next) if count >= per_page && next != url => {
                    url = next;
                    page_number += 1;
                }
                _ => break,
            }
        }

        let catalog = OrganizationCatalog::from_listing(organization, listed, &self.filter, partial);
        info!(
            org = organization,
            repositories = catalog.len(),
            pages = page_number,
            partial,
            "Repository catalog built"
        );
        Ok(catalog)
    }
}
