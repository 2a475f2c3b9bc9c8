//! Point-in-time reconstruction of the source tree from the manifest.

use crate::executor::archive::{open_artifact, read_artifact, HashingReader, ARTIFACT_TIME_FORMAT};
use crate::executor::manifest::{EntryKind, Manifest, ManifestEntry};
use crate::executor::Diagnostic;
use crate::fs::atomic::{temp_path_for, write_atomic, Overwrite};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Outcome of a restore
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Point in time restored (None = latest)
    pub at: Option<DateTime<Utc>>,
    pub files: usize,
    pub symlinks: usize,
    pub directories: usize,
    /// Paths whose artifact was pruned on purpose
    pub pruned: usize,
    /// Uncompressed bytes written
    pub bytes: u64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a `--at` argument: RFC 3339 or the artifact name format.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(input, ARTIFACT_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y%m%dT%H%M%SZ"))
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            BackupError::InvalidTimestamp(format!(
                "'{}' (expected RFC 3339 or YYYYMMDDTHHMMSS[.ffffff]Z)",
                input
            ))
        })
}

/// Present entry of every path as of `at` (latest when `None`).
pub fn state_at(manifest: &Manifest, at: Option<DateTime<Utc>>) -> BTreeMap<String, ManifestEntry> {
    manifest
        .entries
        .keys()
        .filter_map(|path| {
            let entry = match at {
                Some(at) => manifest.entry_at(path, at),
                None => manifest.latest(path),
            }?;
            entry.is_present().then(|| (path.clone(), entry.clone()))
        })
        .collect()
}

/// Rebuild the tree state at `at` under `target`, which must be empty or
/// absent. Per-file problems become diagnostics.
pub fn restore_tree(
    manifest: &Manifest,
    backup_root: &Path,
    at: Option<DateTime<Utc>>,
    target: &Path,
) -> Result<RestoreReport> {
    prepare_target(target)?;

    let state = state_at(manifest, at);
    info!(
        "Restoring {} paths into {}{}",
        state.len(),
        target.display(),
        at.map(|ts| format!(" as of {}", ts.to_rfc3339())).unwrap_or_default()
    );

    let mut report = RestoreReport {
        at,
        ..RestoreReport::default()
    };

    for (path, entry) in state {
        let Some(artifact) = entry.artifact.as_deref() else {
            continue;
        };
        if manifest.pruned.contains(artifact) {
            debug!("Skipping {} v{}: artifact pruned", path, entry.version);
            report.pruned += 1;
            continue;
        }

        let dest = join_relative(target, &path);
        let result = match entry.kind {
            EntryKind::File => restore_file(backup_root, artifact, &dest, &entry),
            EntryKind::Symlink => restore_symlink(backup_root, artifact, &dest).map(|_| 0),
            EntryKind::Directory => restore_directory(backup_root, artifact, &dest, &entry),
        };

        match result {
            Ok(bytes) => {
                match entry.kind {
                    EntryKind::File => report.files += 1,
                    EntryKind::Symlink => report.symlinks += 1,
                    EntryKind::Directory => report.directories += 1,
                }
                report.bytes += bytes;
            }
            Err(err) => {
                warn!("Failed to restore {}: {}", path, err);
                report.diagnostics.push(Diagnostic::from_error(&path, &err));
            }
        }
    }

    info!(
        "Restore completed: {} files, {} symlinks, {} directories, {} pruned, {} problems",
        report.files,
        report.symlinks,
        report.directories,
        report.pruned,
        report.diagnostics.len()
    );
    Ok(report)
}

fn prepare_target(target: &Path) -> Result<()> {
    match std::fs::read_dir(target) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(BackupError::Config(format!(
                    "Restore target {} is not empty",
                    target.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(target)?;
            Ok(())
        }
        Err(e) => Err(BackupError::Config(format!(
            "Restore target {} is unusable: {}",
            target.display(),
            e
        ))),
    }
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
}

fn restore_file(backup_root: &Path, artifact: &str, dest: &Path, entry: &ManifestEntry) -> Result<u64> {
    let reader = open_artifact(backup_root, artifact)?;
    let mut reader = HashingReader::new(reader);

    write_atomic(dest, Overwrite::Never, |w| io::copy(&mut reader, w))
        .map_err(|e| BackupError::write(artifact, e))?;

    let (bytes, hash) = reader.finish();
    if let Some(expected) = &entry.content_hash {
        if expected != &hash {
            return Err(BackupError::read(
                artifact,
                format!("content hash mismatch (expected {}, got {})", expected, hash),
            ));
        }
    }

    if entry.mtime_us >= 0 {
        let mtime = UNIX_EPOCH + Duration::from_micros(entry.mtime_us as u64);
        let touched = std::fs::File::options()
            .write(true)
            .open(dest)
            .and_then(|f| f.set_modified(mtime));
        if let Err(e) = touched {
            debug!("Could not set mtime on {}: {}", dest.display(), e);
        }
    }

    Ok(bytes)
}

/// Unpack a directory archive into a sibling staging directory, check the
/// stream hash, then move the directory into place.
fn restore_directory(
    backup_root: &Path,
    artifact: &str,
    dest: &Path,
    entry: &ManifestEntry,
) -> Result<u64> {
    let staging = temp_path_for(dest);
    let result = unpack_directory(backup_root, artifact, dest, &staging, entry);
    if let Err(e) = std::fs::remove_dir_all(&staging) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Could not remove {}: {}", staging.display(), e);
        }
    }
    result
}

fn unpack_directory(
    backup_root: &Path,
    artifact: &str,
    dest: &Path,
    staging: &Path,
    entry: &ManifestEntry,
) -> Result<u64> {
    let name = dest
        .file_name()
        .ok_or_else(|| BackupError::write(artifact, "restore destination has no name"))?;
    let reader = HashingReader::new(open_artifact(backup_root, artifact)?);
    std::fs::create_dir_all(staging).map_err(|e| BackupError::write(artifact, e))?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive
        .unpack(staging)
        .map_err(|e| BackupError::read(artifact, e))?;

    // The end-of-archive padding is part of the recorded hash.
    let mut reader = archive.into_inner();
    io::copy(&mut reader, &mut io::sink()).map_err(|e| BackupError::read(artifact, e))?;
    let (bytes, hash) = reader.finish();
    if let Some(expected) = &entry.content_hash {
        if expected != &hash {
            return Err(BackupError::read(
                artifact,
                format!("content hash mismatch (expected {}, got {})", expected, hash),
            ));
        }
    }

    std::fs::rename(staging.join(name), dest).map_err(|e| BackupError::write(artifact, e))?;
    Ok(bytes)
}

fn restore_symlink(backup_root: &Path, artifact: &str, dest: &Path) -> Result<()> {
    let target = read_artifact(backup_root, artifact)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BackupError::write(artifact, e))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(&target), dest)
            .map_err(|e| BackupError::write(artifact, e))
    }

    #[cfg(not(unix))]
    {
        use std::io::Write;
        write_atomic(dest, Overwrite::Never, |w| w.write_all(&target))
            .map_err(|e| BackupError::write(artifact, e))
    }
}
