//! Integrity check of stored artifacts.
//!
//! Every retained artifact of a Present entry is decompressed and its SHA-256
//! compared with the hash recorded at archive time. Pruned artifacts are
//! counted but not checked.

use crate::executor::archive::{open_artifact, HashingReader};
use crate::executor::manifest::Manifest;
use crate::utils::BackupError;
use std::io;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStatus {
    Ok,
    Missing,
    Mismatched { expected: String, actual: String },
    /// Present but fails to decompress
    Corrupt(String),
}

/// Result for one problematic artifact
#[derive(Debug, Clone)]
pub struct ArtifactCheck {
    pub path: String,
    pub version: u64,
    pub artifact: String,
    pub status: ArtifactStatus,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub ok: usize,
    pub pruned: usize,
    /// Everything that did not verify
    pub problems: Vec<ArtifactCheck>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn missing(&self) -> usize {
        self.count(|s| matches!(s, ArtifactStatus::Missing))
    }

    pub fn mismatched(&self) -> usize {
        self.count(|s| matches!(s, ArtifactStatus::Mismatched { .. } | ArtifactStatus::Corrupt(_)))
    }

    fn count(&self, pred: impl Fn(&ArtifactStatus) -> bool) -> usize {
        self.problems.iter().filter(|c| pred(&c.status)).count()
    }
}

pub fn verify_artifacts(manifest: &Manifest, backup_root: &Path) -> VerifyReport {
    let mut report = VerifyReport::default();

    for (path, history) in &manifest.entries {
        for entry in history.iter().filter(|e| e.is_present()) {
            let Some(artifact) = entry.artifact.as_deref() else {
                continue;
            };
            if manifest.pruned.contains(artifact) {
                report.pruned += 1;
                continue;
            }

            report.checked += 1;
            let status = check_artifact(backup_root, artifact, entry.content_hash.as_deref());
            if status == ArtifactStatus::Ok {
                report.ok += 1;
            } else {
                warn!("{} v{} ({}): {:?}", path, entry.version, artifact, status);
                report.problems.push(ArtifactCheck {
                    path: path.clone(),
                    version: entry.version,
                    artifact: artifact.to_string(),
                    status,
                });
            }
        }
    }

    info!(
        "Verified {} artifacts: {} ok, {} missing, {} mismatched, {} pruned",
        report.checked,
        report.ok,
        report.missing(),
        report.mismatched(),
        report.pruned
    );
    report
}

fn check_artifact(backup_root: &Path, artifact: &str, expected: Option<&str>) -> ArtifactStatus {
    let reader = match open_artifact(backup_root, artifact) {
        Ok(reader) => reader,
        Err(BackupError::ArtifactMissing(_)) => return ArtifactStatus::Missing,
        Err(e) => return ArtifactStatus::Corrupt(e.to_string()),
    };

    let mut reader = HashingReader::new(reader);
    if let Err(e) = io::copy(&mut reader, &mut io::sink()) {
        return ArtifactStatus::Corrupt(e.to_string());
    }
    let (_, actual) = reader.finish();

    match expected {
        Some(expected) if expected != actual => ArtifactStatus::Mismatched {
            expected: expected.to_string(),
            actual,
        },
        _ => ArtifactStatus::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::BackupEngine;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn backed_up(files: &[(&str, &str)]) -> (TempDir, TempDir, BackupEngine) {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(src.path().join(name), content).unwrap();
        }
        let engine = BackupEngine::new(Config::for_paths(src.path(), bkp.path())).unwrap();
        engine.run(&CancellationToken::new(), false).await.unwrap();
        (src, bkp, engine)
    }

    fn artifact_of(engine: &BackupEngine, path: &str) -> String {
        let manifest = engine.load_manifest().unwrap();
        manifest.latest(path).unwrap().artifact.clone().unwrap()
    }

    #[tokio::test]
    async fn test_clean_store_verifies() {
        let (_src, _bkp, engine) = backed_up(&[("a.txt", "hello"), ("b.txt", "world")]).await;
        let report = engine.verify().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.ok, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_missing_and_tampered_artifacts() {
        let (_src, bkp, engine) = backed_up(&[("a.txt", "hello"), ("b.txt", "world")]).await;

        fs::remove_file(bkp.path().join(artifact_of(&engine, "a.txt"))).unwrap();

        // Valid gzip, wrong content
        let tampered = bkp.path().join(artifact_of(&engine, "b.txt"));
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, b"other").unwrap();
        fs::write(&tampered, encoder.finish().unwrap()).unwrap();

        let report = engine.verify().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.ok, 0);
        assert_eq!(report.missing(), 1);
        assert_eq!(report.mismatched(), 1);
    }

    #[tokio::test]
    async fn test_garbage_artifact_is_corrupt() {
        let (_src, bkp, engine) = backed_up(&[("a.txt", "hello")]).await;
        fs::write(bkp.path().join(artifact_of(&engine, "a.txt")), b"not gzip").unwrap();

        let report = engine.verify().await.unwrap();
        assert!(matches!(report.problems[0].status, ArtifactStatus::Corrupt(_)));
    }
}
