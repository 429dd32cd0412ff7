//! Utility modules for the backup engine.

pub mod errors;
pub mod format;
pub mod logger;
pub mod retry;

pub use errors::{BackupError, Result};
pub use retry::RetryPolicy;
