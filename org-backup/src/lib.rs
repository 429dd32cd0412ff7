//! Organization Backup Library
//!
//! Backs up every repository of a GitHub organization (bare git mirror,
//! metadata collections, wiki) to object storage within a fixed time budget.

pub mod budget;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod executor;
pub mod github;
pub mod orchestrator;
pub mod report;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use report::{RunReport, RunSignal};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
