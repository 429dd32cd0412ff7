//! GitHub REST API access: rate-limited client, shared rate budget and the
//! organization repository enumerator.

pub mod client;
pub mod enumerator;
pub mod models;
pub mod rate_budget;

pub use client::{ApiClient, Page};
pub use enumerator::{Enumerator, RepositoryLister};
pub use models::{CatalogFilter, OrganizationCatalog, RepositoryRef};
pub use rate_budget::RateBudget;
