//! Autobkp Library
//!
//! Incremental backup engine: timestamped compressed copies of changed files
//! plus an append-only manifest from which any earlier tree state can be
//! restored.

pub mod config;
pub mod executor;
pub mod fs;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupEngine, RunSummary};
pub use utils::errors::{BackupError, Result};
