//! Append-only manifest of every tracked path and its version history.
//!
//! Serialized as `<backup>/.autobkp/manifest.json`. Each path owns an
//! ordered list of entries whose `version` strictly increases; the last
//! entry gives the path's current status. Entries are appended, never edited
//! or removed, and the whole file is replaced atomically on every commit.

use crate::fs::atomic::{write_atomic, Overwrite};
use crate::fs::metadata::RecordKind;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Highest manifest format this build understands.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Present,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    File,
    Symlink,
    /// Directory stored as one tar artifact
    Directory,
}

impl From<&RecordKind> for EntryKind {
    fn from(kind: &RecordKind) -> Self {
        match kind {
            RecordKind::SymlinkLike { .. } => EntryKind::Symlink,
            RecordKind::Directory => EntryKind::Directory,
            RecordKind::Regular | RecordKind::Unreadable { .. } => EntryKind::File,
        }
    }
}

/// One versioned observation of a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub status: EntryStatus,
    #[serde(default)]
    pub kind: EntryKind,
    /// Artifact location relative to the backup root (Present only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub size: u64,
    pub mtime_us: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ManifestEntry {
    pub fn is_present(&self) -> bool {
        self.status == EntryStatus::Present
    }

    /// Tombstone following `previous`; keeps the last known attributes.
    pub fn tombstone(previous: &ManifestEntry, version: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            version,
            timestamp,
            status: EntryStatus::Deleted,
            kind: previous.kind,
            artifact: None,
            size: previous.size,
            mtime_us: previous.mtime_us,
            content_hash: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ManifestEntry>>,
    /// Artifacts removed by an explicit prune
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pruned: BTreeSet<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            source_root: None,
            updated_at: None,
            entries: BTreeMap::new(),
            pruned: BTreeSet::new(),
        }
    }
}

impl Manifest {
    pub fn new(source_root: Option<PathBuf>) -> Self {
        Self {
            source_root,
            ..Self::default()
        }
    }

    /// Most recent entry for `path`.
    pub fn latest(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path).and_then(|history| history.last())
    }

    /// Latest entry of every path ever recorded.
    pub fn latest_state(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.entries
            .iter()
            .filter_map(|(path, history)| history.last().map(|entry| (path, entry)))
    }

    /// Full version history of `path`, oldest first.
    pub fn history(&self, path: &str) -> &[ManifestEntry] {
        self.entries.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Latest entry of `path` with `timestamp <= at`.
    pub fn entry_at(&self, path: &str, at: DateTime<Utc>) -> Option<&ManifestEntry> {
        self.history(path).iter().rev().find(|e| e.timestamp <= at)
    }

    pub fn next_version(&self, path: &str) -> u64 {
        self.latest(path).map(|e| e.version + 1).unwrap_or(1)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Newest timestamp recorded anywhere in the manifest.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest_state().map(|(_, e)| e.timestamp).max()
    }

    /// Timestamp for a new run: `now` at microsecond precision, pushed past
    /// the newest recorded timestamp so artifact names never collide.
    pub fn run_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        match self.last_timestamp() {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Append one entry, enforcing the per-path ordering invariants.
    pub fn append(&mut self, path: &str, entry: ManifestEntry) -> std::result::Result<(), String> {
        check_entry_shape(path, &entry)?;
        if let Some(last) = self.latest(path) {
            if entry.version <= last.version {
                return Err(format!(
                    "{}: version {} does not follow {}",
                    path, entry.version, last.version
                ));
            }
            if entry.timestamp <= last.timestamp {
                return Err(format!(
                    "{}: timestamp {} is not after {}",
                    path, entry.timestamp, last.timestamp
                ));
            }
        }
        self.entries.entry(path.to_string()).or_default().push(entry);
        Ok(())
    }

    /// Check the invariants of a loaded manifest.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.format_version == 0 || self.format_version > FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (max {})",
                self.format_version, FORMAT_VERSION
            ));
        }
        for (path, history) in &self.entries {
            if history.is_empty() {
                return Err(format!("{}: empty history", path));
            }
            for entry in history {
                check_entry_shape(path, entry)?;
            }
            for pair in history.windows(2) {
                if pair[1].version <= pair[0].version {
                    return Err(format!(
                        "{}: version {} does not follow {}",
                        path, pair[1].version, pair[0].version
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_entry_shape(path: &str, entry: &ManifestEntry) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("entry with empty path".to_string());
    }
    if entry.version == 0 {
        return Err(format!("{}: version numbers start at 1", path));
    }
    match (entry.status, &entry.artifact) {
        (EntryStatus::Present, None) => Err(format!(
            "{}: present entry v{} has no artifact",
            path, entry.version
        )),
        (EntryStatus::Deleted, Some(_)) => Err(format!(
            "{}: tombstone v{} references an artifact",
            path, entry.version
        )),
        _ => Ok(()),
    }
}

/// Loads and atomically replaces the manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest. A missing file is an empty manifest; anything
    /// unreadable or invalid is `ManifestCorrupt` and must abort the run.
    pub fn load(&self) -> Result<Manifest> {
        if !self.path.try_exists().map_err(|e| self.corrupt(e))? {
            info!("No manifest at {}, starting fresh", self.path.display());
            return Ok(Manifest::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| self.corrupt(e))?;
        let manifest: Manifest = serde_json::from_str(&content).map_err(|e| self.corrupt(e))?;
        manifest.validate().map_err(|e| self.corrupt(e))?;

        debug!(
            "Loaded manifest: {} paths, {} entries",
            manifest.entries.len(),
            manifest.entry_count()
        );
        Ok(manifest)
    }

    /// Append `entries` to a copy of `base` and replace the manifest file.
    /// On failure the file on disk is untouched and `base` stays valid.
    pub fn commit(&self, base: &Manifest, entries: Vec<(String, ManifestEntry)>) -> Result<Manifest> {
        let mut next = base.clone();
        let count = entries.len();
        for (path, entry) in entries {
            next.append(&path, entry).map_err(|e| self.commit_error(e))?;
        }
        next.updated_at = Some(Utc::now());

        self.write(&next)?;
        info!(
            "Committed {} new entries to {} ({} total)",
            count,
            self.path.display(),
            next.entry_count()
        );
        Ok(next)
    }

    /// Record `artifacts` as pruned and replace the manifest file.
    pub fn commit_pruned(&self, base: &Manifest, artifacts: &[String]) -> Result<Manifest> {
        let mut next = base.clone();
        next.pruned.extend(artifacts.iter().cloned());
        next.updated_at = Some(Utc::now());
        self.write(&next)?;
        Ok(next)
    }

    fn write(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.path, Overwrite::Replace, |w| {
            w.write_all(&json)?;
            w.write_all(b"\n")
        })
        .map_err(|e| self.commit_error(e))
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> BackupError {
        BackupError::ManifestCorrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn commit_error(&self, message: impl std::fmt::Display) -> BackupError {
        BackupError::ManifestCommit {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn present(version: u64, at: DateTime<Utc>) -> ManifestEntry {
        ManifestEntry {
            version,
            timestamp: at,
            status: EntryStatus::Present,
            kind: EntryKind::File,
            artifact: Some(format!("a.txt/v{}.gz", version)),
            size: 5,
            mtime_us: 1,
            content_hash: None,
        }
    }

    #[test]
    fn test_append_enforces_monotonic_versions() {
        let mut manifest = Manifest::default();
        manifest.append("a.txt", present(1, ts(0))).unwrap();
        manifest.append("a.txt", present(2, ts(1))).unwrap();

        assert!(manifest.append("a.txt", present(2, ts(2))).is_err());
        assert!(manifest.append("a.txt", present(3, ts(1))).is_err());
        assert_eq!(manifest.history("a.txt").len(), 2);
        assert_eq!(manifest.next_version("a.txt"), 3);
        assert_eq!(manifest.next_version("b.txt"), 1);
    }

    #[test]
    fn test_entry_shape() {
        let mut manifest = Manifest::default();
        let mut bad = present(1, ts(0));
        bad.artifact = None;
        assert!(manifest.append("a.txt", bad).is_err());

        let tomb = ManifestEntry::tombstone(&present(1, ts(0)), 2, ts(1));
        assert!(tomb.artifact.is_none());
        assert!(!tomb.is_present());
    }

    #[test]
    fn test_entry_at_and_latest() {
        let mut manifest = Manifest::default();
        manifest.append("a.txt", present(1, ts(0))).unwrap();
        manifest.append("a.txt", present(2, ts(10))).unwrap();
        let tomb = ManifestEntry::tombstone(&present(2, ts(10)), 3, ts(20));
        manifest.append("a.txt", tomb).unwrap();

        assert_eq!(manifest.entry_at("a.txt", ts(5)).unwrap().version, 1);
        assert_eq!(manifest.entry_at("a.txt", ts(10)).unwrap().version, 2);
        assert!(manifest.entry_at("a.txt", ts(-1)).is_none());
        assert_eq!(manifest.latest("a.txt").unwrap().status, EntryStatus::Deleted);
    }

    #[test]
    fn test_run_timestamp_moves_forward() {
        let mut manifest = Manifest::default();
        manifest.append("a.txt", present(1, ts(10))).unwrap();

        let bumped = manifest.run_timestamp(ts(5));
        assert_eq!(bumped, ts(10) + Duration::microseconds(1));
        assert_eq!(manifest.run_timestamp(ts(11)), ts(11));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::new(temp.path().join("manifest.json"));
        let manifest = store.load().unwrap();
        assert!(manifest.entries.is_empty());
        assert_eq!(manifest.format_version, FORMAT_VERSION);
    }

    #[test]
    fn test_unreachable_manifest_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join(".autobkp");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = ManifestStore::new(blocker.join("manifest.json")).load().unwrap_err();
        assert!(matches!(err, BackupError::ManifestCorrupt { .. }));
    }

    #[test]
    fn test_commit_then_load() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::new(temp.path().join(".autobkp/manifest.json"));

        let base = Manifest::new(Some(PathBuf::from("/src")));
        let committed = store
            .commit(&base, vec![("a.txt".to_string(), present(1, ts(0)))])
            .unwrap();
        assert!(base.entries.is_empty());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.entries, committed.entries);
        assert_eq!(loaded.source_root, Some(PathBuf::from("/src")));
    }

    #[test]
    fn test_corrupt_manifest_is_fatal_and_preserved() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = ManifestStore::new(&path);
        let err = store.load().unwrap_err();
        assert!(matches!(err, BackupError::ManifestCorrupt { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not json");
    }

    #[test]
    fn test_invalid_history_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");

        let mut manifest = Manifest::default();
        manifest
            .entries
            .insert("a.txt".to_string(), vec![present(2, ts(0)), present(1, ts(1))]);
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();

        let err = ManifestStore::new(&path).load().unwrap_err();
        assert!(matches!(err, BackupError::ManifestCorrupt { .. }));
    }

    #[test]
    fn test_future_format_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, br#"{"format_version": 99, "entries": {}}"#).unwrap();

        assert!(ManifestStore::new(&path).load().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(present(1, ts(0))).unwrap();
        assert_eq!(json["status"], "present");
        assert_eq!(json["kind"], "file");
        assert!(json.get("content_hash").is_none());

        let mut dir = present(1, ts(0));
        dir.kind = EntryKind::Directory;
        assert_eq!(serde_json::to_value(dir).unwrap()["kind"], "directory");
    }
}
