//! Explicit retention: prune old artifacts on request.
//!
//! Backup runs never delete anything. Pruning records the doomed artifacts
//! in the manifest first, then removes the files, so a crash in between
//! leaves only unreferenced files behind. Entries themselves stay.

use crate::executor::manifest::{Manifest, ManifestStore};
use crate::executor::{Diagnostic, DiagnosticKind};
use crate::utils::{BackupError, Result};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub keep: usize,
    /// Artifacts newly marked as pruned
    pub pruned: Vec<String>,
    /// Files actually deleted
    pub removed: usize,
    pub freed_bytes: u64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Present artifacts older than the newest `keep` present versions of each
/// path, excluding those already pruned.
pub fn prunable_artifacts(manifest: &Manifest, keep: usize) -> Vec<String> {
    let mut doomed = Vec::new();
    for history in manifest.entries.values() {
        let present: Vec<&str> = history
            .iter()
            .filter(|e| e.is_present())
            .filter_map(|e| e.artifact.as_deref())
            .collect();
        let excess = present.len().saturating_sub(keep);
        doomed.extend(
            present[..excess]
                .iter()
                .filter(|a| !manifest.pruned.contains(**a))
                .map(|a| a.to_string()),
        );
    }
    doomed
}

pub fn prune(store: &ManifestStore, manifest: &Manifest, backup_root: &Path, keep: usize) -> Result<PruneReport> {
    if keep == 0 {
        return Err(BackupError::Config(
            "prune must keep at least one version".to_string(),
        ));
    }

    let mut report = PruneReport {
        keep,
        ..PruneReport::default()
    };

    let doomed = prunable_artifacts(manifest, keep);
    if doomed.is_empty() {
        info!("Nothing to prune (keeping {} versions per path)", keep);
        return Ok(report);
    }

    store.commit_pruned(manifest, &doomed)?;

    for artifact in &doomed {
        let path = backup_root.join(artifact);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Pruned {}", artifact);
                report.removed += 1;
                report.freed_bytes += size;
                if let Some(parent) = path.parent() {
                    // Only succeeds once the directory is empty
                    let _ = std::fs::remove_dir(parent);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {}: {}", artifact, e);
                report.diagnostics.push(Diagnostic {
                    path: artifact.clone(),
                    kind: DiagnosticKind::Write,
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        "Pruned {} artifacts ({} files removed, {} bytes freed)",
        doomed.len(),
        report.removed,
        report.freed_bytes
    );
    report.pruned = doomed;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::archive::read_artifact;
    use crate::executor::BackupEngine;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn three_versions() -> (TempDir, TempDir, BackupEngine) {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let engine = BackupEngine::new(Config::for_paths(src.path(), bkp.path())).unwrap();
        let cancel = CancellationToken::new();
        for content in ["one", "two!", "three"] {
            fs::write(src.path().join("a.txt"), content).unwrap();
            engine.run(&cancel, false).await.unwrap();
        }
        (src, bkp, engine)
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_versions() {
        let (_src, bkp, engine) = three_versions().await;

        let report = engine.prune(1).await.unwrap();
        assert_eq!(report.pruned.len(), 2);
        assert_eq!(report.removed, 2);

        let manifest = engine.load_manifest().unwrap();
        assert_eq!(manifest.history("a.txt").len(), 3);
        assert_eq!(manifest.pruned.len(), 2);
        let latest = manifest.latest("a.txt").unwrap().artifact.clone().unwrap();
        assert_eq!(read_artifact(bkp.path(), &latest).unwrap(), b"three");

        let verify = engine.verify().await.unwrap();
        assert!(verify.is_clean());
        assert_eq!(verify.pruned, 2);
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let (_src, _bkp, engine) = three_versions().await;
        engine.prune(2).await.unwrap();
        let manifest_before = fs::read(engine.config().manifest_path()).unwrap();

        let again = engine.prune(2).await.unwrap();
        assert!(again.pruned.is_empty());
        assert_eq!(fs::read(engine.config().manifest_path()).unwrap(), manifest_before);
    }

    #[tokio::test]
    async fn test_prune_keeps_last_version_of_deleted_path() {
        let (src, bkp, engine) = three_versions().await;
        fs::remove_file(src.path().join("a.txt")).unwrap();
        engine.run(&CancellationToken::new(), false).await.unwrap();

        engine.prune(1).await.unwrap();
        let manifest = engine.load_manifest().unwrap();
        let history = manifest.history("a.txt");
        let last_present = history[2].artifact.clone().unwrap();
        assert!(!manifest.pruned.contains(&last_present));
        assert!(bkp.path().join(&last_present).exists());
    }

    #[tokio::test]
    async fn test_prune_zero_is_rejected() {
        let (_src, _bkp, engine) = three_versions().await;
        assert!(matches!(engine.prune(0).await, Err(BackupError::Config(_))));
    }
}
