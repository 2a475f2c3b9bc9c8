//! Error types for the backup engine.
//!
//! `Read` and `Write` are per-file and never abort a run; they are turned into
//! diagnostics by the executor. Manifest errors and `Cancelled` are fatal.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Cannot read '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Cannot write artifact for '{path}': {message}")]
    Write { path: String, message: String },

    #[error("Manifest '{}' is corrupt: {reason}", path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Failed to commit manifest '{}': {message}", path.display())]
    ManifestCommit { path: PathBuf, message: String },

    #[error("Artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    pub fn read(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BackupError::Read {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn write(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BackupError::Write {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
