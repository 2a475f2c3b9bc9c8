//! Per-file records produced by the scanner.
//!
//! A `FileRecord` is a snapshot of one path at scan time. It is never
//! mutated after construction; the next scan produces a fresh one.

use sha2::{Digest, Sha256};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// What kind of filesystem object a record describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// Regular file, content archived as-is
    Regular,

    /// Symbolic link or reparse point; never followed, the link target is
    /// archived as its content
    SymlinkLike { target: PathBuf },

    /// Directory stored whole as one tar artifact. Size is the sum over its
    /// subtree, mtime the newest one found in it.
    Directory,

    /// Could not be read; excluded from comparison and reported as skipped
    Unreadable { reason: String },
}

/// Information about one path discovered during a scan
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Path relative to the source root, `/`-separated. Unique within a scan.
    pub relative_path: String,

    /// Full path on disk
    pub path: PathBuf,

    /// Size in bytes (link target length for symlinks)
    pub size: u64,

    /// Last modified time, microseconds since the Unix epoch
    pub mtime_us: i64,

    /// Hex SHA-256 of the content, only when hashing is enabled
    pub content_hash: Option<String>,

    pub kind: RecordKind,
}

impl FileRecord {
    /// Build a record for a regular file. Opens the file to confirm it is
    /// readable and, when `hash` is set, digests its content.
    pub fn regular(relative_path: String, path: PathBuf, metadata: &Metadata, hash: bool) -> Self {
        let checked = if hash {
            hash_file(&path).map(Some)
        } else {
            File::open(&path).map(|_| None)
        };

        match checked {
            Ok(content_hash) => Self {
                relative_path,
                size: metadata.len(),
                mtime_us: mtime_micros(metadata),
                content_hash,
                kind: RecordKind::Regular,
                path,
            },
            Err(e) => Self::unreadable(relative_path, path, e.to_string()),
        }
    }

    /// Build a record for a symlink from its own (unfollowed) metadata.
    pub fn symlink(relative_path: String, path: PathBuf, metadata: &Metadata, hash: bool) -> Self {
        match fs::read_link(&path) {
            Ok(target) => {
                let bytes = target.as_os_str().as_encoded_bytes();
                let content_hash = hash.then(|| hash_bytes(bytes));
                Self {
                    relative_path,
                    size: bytes.len() as u64,
                    mtime_us: mtime_micros(metadata),
                    content_hash,
                    kind: RecordKind::SymlinkLike { target },
                    path,
                }
            }
            Err(e) => Self::unreadable(relative_path, path, e.to_string()),
        }
    }

    /// Build a record for a directory archived as a unit. Any entry of the
    /// subtree that cannot be read makes the whole record unreadable.
    pub fn directory(relative_path: String, path: PathBuf) -> Self {
        let mut size = 0u64;
        let mut mtime_us = i64::MIN;

        for entry in WalkDir::new(&path).follow_links(false) {
            let metadata = match entry.and_then(|e| e.metadata()) {
                Ok(metadata) => metadata,
                Err(e) => return Self::unreadable(relative_path, path, e.to_string()),
            };
            if !metadata.is_dir() {
                size += metadata.len();
            }
            mtime_us = mtime_us.max(mtime_micros(&metadata));
        }

        Self {
            relative_path,
            path,
            size,
            mtime_us,
            content_hash: None,
            kind: RecordKind::Directory,
        }
    }

    pub fn unreadable(relative_path: String, path: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            relative_path,
            path,
            size: 0,
            mtime_us: 0,
            content_hash: None,
            kind: RecordKind::Unreadable {
                reason: reason.into(),
            },
        }
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self.kind, RecordKind::Unreadable { .. })
    }
}

/// Modification time in microseconds since the epoch. Times before the
/// epoch come out negative.
pub fn mtime_micros(metadata: &Metadata) -> i64 {
    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
    system_time_micros(modified)
}

pub fn system_time_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// Hex SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
