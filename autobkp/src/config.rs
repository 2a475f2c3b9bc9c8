//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; command-line flags override
//! individual values after loading.

use crate::fs::pattern::PatternSet;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the metadata directory inside the backup root.
pub const META_DIR: &str = ".autobkp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory tree to back up
    #[serde(default)]
    pub source: PathBuf,

    /// Backup store root (artifacts + manifest)
    #[serde(default)]
    pub backup: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Include patterns. Empty means everything not excluded.
    #[serde(default)]
    pub include: Vec<String>,

    /// Exclude patterns (file/dir names or `**` globs over relative paths)
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Directories stored whole as one tar artifact instead of file by file
    #[serde(default = "default_archive_dirs")]
    pub archive_dirs: Vec<String>,

    /// Compare SHA-256 content hashes instead of size + mtime
    #[serde(default)]
    pub verify_hash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Compression algorithm (gzip, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (0-9 for gzip, 1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,

    /// Number of files archived concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Present versions kept per path by `prune`. None keeps everything.
    #[serde(default)]
    pub keep_versions: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write a per-run log under `<backup>/.autobkp/logs/`
    #[serde(default = "default_to_file")]
    pub to_file: bool,
}

// Default values
fn default_exclude() -> Vec<String> {
    vec!["__pycache__".to_string(), ".ipynb_checkpoints".to_string()]
}

fn default_archive_dirs() -> Vec<String> {
    vec![".git".to_string()]
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_compression_level() -> i32 {
    6
}

fn default_workers() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_to_file() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_exclude(),
            archive_dirs: default_archive_dirs(),
            verify_hash: false,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            level: default_compression_level(),
            workers: default_workers(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: default_to_file(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration for a source/backup pair with every other knob defaulted.
    pub fn for_paths(source: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        Config {
            paths: PathsConfig {
                source: source.into(),
                backup: backup.into(),
            },
            ..Config::default()
        }
    }

    /// Path of the metadata directory inside the backup root
    pub fn meta_dir(&self) -> PathBuf {
        self.paths.backup.join(META_DIR)
    }

    /// Path of the manifest file
    pub fn manifest_path(&self) -> PathBuf {
        self.meta_dir().join("manifest.json")
    }

    /// Directory receiving per-run log files
    pub fn log_dir(&self) -> PathBuf {
        self.meta_dir().join("logs")
    }

    /// Check settings before any filesystem work starts
    pub fn validate(&self) -> Result<()> {
        if self.paths.source.as_os_str().is_empty() {
            return Err(BackupError::Config("Source path is not set".to_string()));
        }
        if self.paths.backup.as_os_str().is_empty() {
            return Err(BackupError::Config("Backup path is not set".to_string()));
        }

        let source = normalize(&self.paths.source);
        let backup = normalize(&self.paths.backup);
        if backup.starts_with(&source) || source.starts_with(&backup) {
            return Err(BackupError::Config(format!(
                "Backup root {} and source root {} must not contain each other",
                self.paths.backup.display(),
                self.paths.source.display()
            )));
        }

        for (key, patterns) in [
            ("scan.include", &self.scan.include),
            ("scan.exclude", &self.scan.exclude),
            ("scan.archive_dirs", &self.scan.archive_dirs),
        ] {
            PatternSet::new(patterns)
                .map_err(|e| BackupError::Config(format!("Invalid pattern in {}: {}", key, e)))?;
        }

        if self.archive.workers == 0 {
            return Err(BackupError::Config(
                "archive.workers must be greater than 0".to_string(),
            ));
        }

        let level_range = match self.archive.compression.as_str() {
            "gzip" => 0..=9,
            "zstd" => 1..=22,
            other => {
                return Err(BackupError::Config(format!(
                    "Unknown compression method '{}' (expected gzip or zstd)",
                    other
                )))
            }
        };
        if !level_range.contains(&self.archive.level) {
            return Err(BackupError::Config(format!(
                "Compression level {} out of range for {}",
                self.archive.level, self.archive.compression
            )));
        }

        if self.retention.keep_versions == Some(0) {
            return Err(BackupError::Config(
                "retention.keep_versions must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Absolute, canonical form of `path` when it exists; otherwise the path
/// joined onto the current directory.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
