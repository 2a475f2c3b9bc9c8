//! Backup pass executor - orchestrates one run.
//!
//! A run is scan → diff → archive → commit, each stage finishing before the
//! next starts. Archiving fans out across a bounded worker pool, and every
//! worker is joined before the manifest is committed. Per-file failures are
//! collected as diagnostics; manifest failures and cancellation abort the
//! run with the previous manifest left authoritative.

pub mod archive;
pub mod diff;
pub mod manifest;
pub mod progress;
pub mod restore;
pub mod retention;
pub mod verify;

use crate::config::Config;
use crate::fs::metadata::{FileRecord, RecordKind};
use crate::fs::walker::{Scanner, WalkOptions};
use crate::utils::{BackupError, Result};
use archive::{ArchivedFile, Archiver, Codec};
use chrono::{DateTime, Utc};
use diff::{diff_against_manifest, ChangeKind, DiffPlan};
use manifest::{EntryKind, EntryStatus, Manifest, ManifestEntry, ManifestStore};
use progress::{format_bytes, format_duration, ArchiveProgress};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use restore::RestoreReport;
pub use retention::PruneReport;
pub use verify::VerifyReport;

/// How often archive progress is logged
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Source could not be read; the path was skipped
    Read,
    /// Destination could not be written; the path is retried next run
    Write,
}

/// Non-fatal, per-path problem reported in a summary
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub path: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn from_error(path: &str, err: &BackupError) -> Self {
        match err {
            BackupError::Read { message, .. } => Self {
                path: path.to_string(),
                kind: DiagnosticKind::Read,
                message: message.clone(),
            },
            BackupError::ArtifactMissing(reference) => Self {
                path: path.to_string(),
                kind: DiagnosticKind::Read,
                message: format!("artifact {} is missing", reference),
            },
            BackupError::Write { message, .. } => Self {
                path: path.to_string(),
                kind: DiagnosticKind::Write,
                message: message.clone(),
            },
            other => Self {
                path: path.to_string(),
                kind: DiagnosticKind::Write,
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DiagnosticKind::Read => "read",
            DiagnosticKind::Write => "write",
        };
        write!(f, "[{}] {}: {}", kind, self.path, self.message)
    }
}

/// Outcome of one backup pass
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Run timestamp shared by every entry and artifact of this run
    pub timestamp: DateTime<Utc>,
    pub unchanged: usize,
    pub modified: usize,
    pub new: usize,
    pub deleted: usize,
    /// Paths that could not be read
    pub skipped: usize,
    /// Paths whose artifact could not be written
    pub failed: usize,
    /// Uncompressed bytes archived (bytes that would be archived on a dry run)
    pub bytes_archived: u64,
    /// Compressed bytes written
    pub stored_bytes: u64,
    pub duration: Duration,
    pub dry_run: bool,
    /// True when the manifest was rewritten
    pub committed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunSummary {
    fn new(timestamp: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            timestamp,
            unchanged: 0,
            modified: 0,
            new: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            bytes_archived: 0,
            stored_bytes: 0,
            duration: Duration::ZERO,
            dry_run,
            committed: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.skipped > 0 || self.failed > 0
    }
}

/// Result of archiving one planned path
struct ArchiveOutcome {
    kind: ChangeKind,
    record: FileRecord,
    result: Result<ArchivedFile>,
}

/// Runs backup passes and the history operations over one source/backup pair
pub struct BackupEngine {
    config: Config,
    store: ManifestStore,
    archiver: Arc<Archiver>,
}

impl BackupEngine {
    /// Validate `config` and prepare an engine for it.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let codec = Codec::from_name(&config.archive.compression)?;
        let archiver = Archiver::new(&config.paths.backup, codec, config.archive.level);
        let store = ManifestStore::new(config.manifest_path());

        Ok(Self {
            config,
            store,
            archiver: Arc::new(archiver),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scanner(&self) -> Result<Scanner> {
        Scanner::new(
            &self.config.paths.source,
            WalkOptions {
                include_patterns: self.config.scan.include.clone(),
                exclude_patterns: self.config.scan.exclude.clone(),
                archive_dirs: self.config.scan.archive_dirs.clone(),
                hash_contents: self.config.scan.verify_hash,
            },
        )
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        self.store.load()
    }

    /// Execute one backup pass.
    pub async fn run(&self, cancel: &CancellationToken, dry_run: bool) -> Result<RunSummary> {
        let start_time = Instant::now();
        let source = self.config.paths.source.clone();
        check_source_root(&source)?;

        let store = self.store.clone();
        let manifest = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(task_failed)??;

        if let Some(recorded) = &manifest.source_root {
            if recorded != &source {
                warn!(
                    "Manifest was recorded for source {}, now backing up {}",
                    recorded.display(),
                    source.display()
                );
            }
        }

        let scanner = self.scanner()?;
        info!(
            "Starting backup of {} into {}{}",
            scanner.root().display(),
            self.archiver.backup_root().display(),
            if dry_run { " (dry run)" } else { "" }
        );

        // Scan + diff in a blocking task (filesystem metadata reads)
        let verify_hash = self.config.scan.verify_hash;
        let archiver = Arc::clone(&self.archiver);
        let (manifest, plan, ts) = tokio::task::spawn_blocking(move || {
            let plan = diff_against_manifest(scanner.scan(), &manifest, verify_hash);
            let ts = run_timestamp(&manifest, &plan, &archiver, Utc::now());
            (manifest, plan, ts)
        })
        .await
        .map_err(task_failed)?;
        debug!("Run timestamp {}", archive::format_timestamp(ts));

        info!(
            "Diff: {} new, {} modified, {} unchanged, {} deleted, {} unreadable",
            plan.count(ChangeKind::New),
            plan.count(ChangeKind::Modified),
            plan.unchanged.len(),
            plan.deleted.len(),
            plan.skipped.len()
        );

        let mut summary = RunSummary::new(ts, dry_run);
        summary.unchanged = plan.unchanged.len();
        for record in &plan.skipped {
            let reason = match &record.kind {
                RecordKind::Unreadable { reason } => reason.clone(),
                _ => "unreadable".to_string(),
            };
            warn!("Skipping {}: {}", record.relative_path, reason);
            summary.skipped += 1;
            summary.diagnostics.push(Diagnostic {
                path: record.relative_path.clone(),
                kind: DiagnosticKind::Read,
                message: reason,
            });
        }

        if cancel.is_cancelled() {
            info!("Backup cancelled after scan, nothing committed");
            return Err(BackupError::Cancelled);
        }

        if dry_run {
            summary.new = plan.count(ChangeKind::New);
            summary.modified = plan.count(ChangeKind::Modified);
            summary.deleted = plan.deleted.len();
            summary.bytes_archived = plan.bytes_to_archive();
            summary.duration = start_time.elapsed();
            for (kind, record) in &plan.to_archive {
                debug!("Would archive {:?} {}", kind, record.relative_path);
            }
            return Ok(summary);
        }

        if plan.is_noop() {
            summary.duration = start_time.elapsed();
            info!(
                "No changes since the last run ({} unchanged, {} skipped)",
                summary.unchanged, summary.skipped
            );
            return Ok(summary);
        }

        let DiffPlan {
            to_archive, deleted, ..
        } = plan;
        let planned = to_archive.len();
        let outcomes = self.archive_all(to_archive, ts, cancel).await;

        if cancel.is_cancelled() {
            info!(
                "Backup cancelled: {} of {} files archived, nothing committed",
                outcomes.len(),
                planned
            );
            return Err(BackupError::Cancelled);
        }

        let mut entries = Vec::with_capacity(outcomes.len() + deleted.len());
        for outcome in outcomes {
            let path = outcome.record.relative_path.clone();
            match outcome.result {
                Ok(archived) => {
                    match outcome.kind {
                        ChangeKind::New => summary.new += 1,
                        _ => summary.modified += 1,
                    }
                    summary.bytes_archived += archived.bytes_read;
                    summary.stored_bytes += archived.stored_bytes;
                    let entry = present_entry(&manifest, &outcome.record, archived, ts);
                    entries.push((path, entry));
                }
                Err(err) => {
                    let diagnostic = Diagnostic::from_error(&path, &err);
                    match diagnostic.kind {
                        DiagnosticKind::Read => summary.skipped += 1,
                        DiagnosticKind::Write => summary.failed += 1,
                    }
                    warn!("{}", err);
                    summary.diagnostics.push(diagnostic);
                }
            }
        }

        for path in deleted {
            if let Some(previous) = manifest.latest(&path) {
                let tombstone = ManifestEntry::tombstone(previous, previous.version + 1, ts);
                debug!("Tombstone {} v{}", path, tombstone.version);
                entries.push((path, tombstone));
                summary.deleted += 1;
            }
        }

        if cancel.is_cancelled() {
            info!("Backup cancelled before commit, nothing committed");
            return Err(BackupError::Cancelled);
        }

        if entries.is_empty() {
            info!("No changes to commit");
        } else {
            let mut base = manifest;
            if base.source_root.is_none() {
                base.source_root = Some(source);
            }
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.commit(&base, entries))
                .await
                .map_err(task_failed)?
                .map_err(|e| {
                    error!("{}", e);
                    e
                })?;
            summary.committed = true;
        }

        summary.duration = start_time.elapsed();
        info!(
            "Backup completed: {} new, {} modified, {} deleted, {} unchanged, {} skipped, {} failed, {} archived ({} stored) in {}",
            summary.new,
            summary.modified,
            summary.deleted,
            summary.unchanged,
            summary.skipped,
            summary.failed,
            format_bytes(summary.bytes_archived),
            format_bytes(summary.stored_bytes),
            format_duration(summary.duration.as_secs())
        );

        Ok(summary)
    }

    /// Archive every planned file on the worker pool and join them all.
    /// Files not started before cancellation produce no outcome.
    async fn archive_all(
        &self,
        work: Vec<(ChangeKind, FileRecord)>,
        ts: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<ArchiveOutcome> {
        if work.is_empty() {
            return Vec::new();
        }

        let total_bytes = work.iter().map(|(_, r)| r.size).sum();
        let progress = Arc::new(ArchiveProgress::new(total_bytes, work.len()));
        let semaphore = Arc::new(Semaphore::new(self.config.archive.workers));

        let stop = cancel.child_token();
        let reporter = progress::spawn_reporter(Arc::clone(&progress), stop.clone(), PROGRESS_INTERVAL);

        let mut handles = Vec::with_capacity(work.len());
        for (kind, record) in work {
            let sem = Arc::clone(&semaphore);
            let archiver = Arc::clone(&self.archiver);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = sem.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let _permit = permit?;
                if cancel.is_cancelled() {
                    return None;
                }

                let path = record.relative_path.clone();
                let blocking_record = record.clone();
                let result = tokio::task::spawn_blocking(move || archiver.archive(&blocking_record, ts))
                    .await
                    .unwrap_or_else(|e| Err(BackupError::write(&path, format!("archive task failed: {}", e))));

                progress.file_done(result.as_ref().map(|a| a.bytes_read).unwrap_or(0));
                Some(ArchiveOutcome { kind, record, result })
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => warn!("Archive task panicked: {}", e),
            }
        }

        stop.cancel();
        let _ = reporter.await;

        let snap = progress.snapshot();
        debug!(
            "Archive pass finished: {} files, {} in {}",
            snap.files_processed,
            format_bytes(snap.archived_bytes),
            format_duration(progress.elapsed().as_secs())
        );

        outcomes
    }

    /// Full version history of one path, oldest first.
    pub fn history(&self, path: &str) -> Result<Vec<ManifestEntry>> {
        let manifest = self.store.load()?;
        let history = manifest.history(path);
        if history.is_empty() {
            return Err(BackupError::NotFound(path.to_string()));
        }
        Ok(history.to_vec())
    }

    /// Reconstruct the tree as of `at` (latest when `None`) into `target`.
    pub async fn restore(&self, at: Option<DateTime<Utc>>, target: &Path) -> Result<RestoreReport> {
        let manifest = self.store.load()?;
        let backup_root = self.archiver.backup_root().to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || restore::restore_tree(&manifest, &backup_root, at, &target))
            .await
            .map_err(task_failed)?
    }

    /// Check every retained artifact against its recorded hash.
    pub async fn verify(&self) -> Result<VerifyReport> {
        let manifest = self.store.load()?;
        let backup_root = self.archiver.backup_root().to_path_buf();
        tokio::task::spawn_blocking(move || Ok(verify::verify_artifacts(&manifest, &backup_root)))
            .await
            .map_err(task_failed)?
    }

    /// Drop artifacts beyond the newest `keep` present versions of each path.
    pub async fn prune(&self, keep: usize) -> Result<PruneReport> {
        let manifest = self.store.load()?;
        let store = self.store.clone();
        let backup_root = self.archiver.backup_root().to_path_buf();
        tokio::task::spawn_blocking(move || retention::prune(&store, &manifest, &backup_root, keep))
            .await
            .map_err(task_failed)?
    }
}

fn present_entry(
    manifest: &Manifest,
    record: &FileRecord,
    archived: ArchivedFile,
    ts: DateTime<Utc>,
) -> ManifestEntry {
    ManifestEntry {
        version: manifest.next_version(&record.relative_path),
        timestamp: ts,
        status: EntryStatus::Present,
        kind: EntryKind::from(&record.kind),
        artifact: Some(archived.artifact),
        size: record.size,
        mtime_us: record.mtime_us,
        content_hash: Some(archived.content_hash),
    }
}

/// Timestamp for this run: strictly after everything in the manifest and
/// after any artifact already stored for a planned path, so a leftover from
/// an interrupted run can never take the new artifact's name.
fn run_timestamp(
    manifest: &Manifest,
    plan: &DiffPlan,
    archiver: &Archiver,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    plan.to_archive
        .iter()
        .fold(manifest.run_timestamp(now), |ts, (_, record)| {
            match archiver.newest_artifact_time(&record.relative_path) {
                Some(existing) if existing >= ts => {
                    debug!(
                        "Unreferenced artifact for {} at {}, moving run time past it",
                        record.relative_path,
                        archive::format_timestamp(existing)
                    );
                    existing + chrono::Duration::microseconds(1)
                }
                _ => ts,
            }
        })
}

/// A missing or unusable source root is fatal; it must never read as
/// "every file deleted".
fn check_source_root(source: &Path) -> Result<()> {
    match std::fs::metadata(source) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(BackupError::Config(format!(
            "Source {} is not a directory",
            source.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound(format!(
            "source directory {}",
            source.display()
        ))),
        Err(e) => Err(BackupError::Io(e)),
    }
}

fn task_failed(e: tokio::task::JoinError) -> BackupError {
    BackupError::Io(std::io::Error::other(format!("background task failed: {}", e)))
}
