//! Repository catalog types.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One backup unit, as listed by the organization's repository API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub name: String,

    /// `owner/name`
    pub full_name: String,

    #[serde(default)]
    pub default_branch: Option<String>,

    #[serde(default)]
    pub has_wiki: bool,

    /// Approximate size as reported by the API, in KiB
    #[serde(default, rename = "size")]
    pub size_kib: u64,

    /// HTTPS clone URL
    pub clone_url: String,

    #[serde(default)]
    pub archived: bool,

    #[serde(default)]
    pub fork: bool,

    #[serde(default)]
    pub private: bool,
}

impl RepositoryRef {
    pub fn new(full_name: &str, clone_url: &str) -> Self {
        let name = full_name.rsplit('/').next().unwrap_or(full_name).to_string();
        Self {
            name,
            full_name: full_name.to_string(),
            default_branch: None,
            has_wiki: false,
            size_kib: 0,
            clone_url: clone_url.to_string(),
            archived: false,
            fork: false,
            private: false,
        }
    }

    pub fn with_wiki(mut self, has_wiki: bool) -> Self {
        self.has_wiki = has_wiki;
        self
    }

    pub fn with_size_kib(mut self, size_kib: u64) -> Self {
        self.size_kib = size_kib;
        self
    }

    /// Clone URL of the repository's wiki (`.../name.wiki.git`).
    pub fn wiki_url(&self) -> String {
        let base = self.clone_url.strip_suffix(".git").unwrap_or(&self.clone_url);
        format!("{}.wiki.git", base)
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, size_kib: u64) -> Self {
        Self::new(
            &format!("acme/{}", name),
            &format!("https://github.com/acme/{}.git", name),
        )
        .with_size_kib(size_kib)
    }
}

/// Which listed repositories take part in a run.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub include_archived: bool,
    pub include_forks: bool,
    /// Empty = all names
    pub only: Vec<String>,
}

impl CatalogFilter {
    pub fn all() -> Self {
        Self {
            include_archived: true,
            include_forks: true,
            only: Vec::new(),
        }
    }

    pub fn accepts(&self, repo: &RepositoryRef) -> bool {
        (self.include_archived || !repo.archived)
            && (self.include_forks || !repo.fork)
            && (self.only.is_empty() || self.only.iter().any(|n| n == &repo.name))
    }
}

/// Ordered, de-duplicated list of repositories for one run.
#[derive(Debug, Clone, Serialize)]
pub struct OrganizationCatalog {
    pub organization: String,
    pub repositories: Vec<RepositoryRef>,
    /// A later page failed; the catalog covers only part of the organization
    pub partial: bool,
}

impl OrganizationCatalog {
    /// Build a catalog keeping API order and the first occurrence of each name.
    pub fn from_listing(
        organization: &str,
        listed: Vec<RepositoryRef>,
        filter: &CatalogFilter,
        partial: bool,
    ) -> Self {
        let mut seen = HashSet::new();
        let repositories = listed
            .into_iter()
            .filter(|repo| seen.insert(repo.name.clone()))
            .filter(|repo| filter.accepts(repo))
            .collect();

        Self {
            organization: organization.to_string(),
            repositories,
            partial,
        }
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_api_repository() {
        let json = serde_json::json!({
            "id": 1,
            "name": "widgets",
            "full_name": "acme/widgets",
            "default_branch": "main",
            "has_wiki": true,
            "size": 2048,
            "clone_url": "https://github.com/acme/widgets.git",
            "archived": false,
            "fork": false,
            "private": true
        });
        let repo: RepositoryRef = serde_json::from_value(json).unwrap();
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.size_kib, 2048);
        assert!(repo.has_wiki);
        assert_eq!(repo.wiki_url(), "https://github.com/acme/widgets.wiki.git");
    }

    #[test]
    fn test_catalog_dedupes_and_keeps_order() {
        let listed = vec![
            RepositoryRef::for_test("b", 1),
            RepositoryRef::for_test("a", 1),
            RepositoryRef::for_test("b", 2),
            RepositoryRef::for_test("c", 1),
        ];
        let catalog = OrganizationCatalog::from_listing("acme", listed, &CatalogFilter::all(), false);
        let names: Vec<_> = catalog.repositories.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(catalog.repositories[0].size_kib, 1);
    }

    #[test]
    fn test_filter_excludes_archived_and_forks() {
        let mut archived = RepositoryRef::for_test("old", 1);
        archived.archived = true;
        let mut fork = RepositoryRef::for_test("fork", 1);
        fork.fork = true;
        let listed = vec![archived, fork, RepositoryRef::for_test("live", 1)];

        let filter = CatalogFilter {
            include_archived: false,
            include_forks: false,
            only: Vec::new(),
        };
        let catalog = OrganizationCatalog::from_listing("acme", listed, &filter, false);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.repositories[0].name, "live");
    }
}
