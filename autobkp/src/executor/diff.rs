//! Classify a scan against the manifest's latest known state.
//!
//! Change detection uses size + mtime (same as rsync's default quick check).
//! When hash verification is on and both sides carry a content hash, the
//! hash decides instead. Without hashes a content change that preserves
//! size and mtime goes unnoticed.

use crate::executor::manifest::{EntryKind, Manifest, ManifestEntry};
use crate::fs::metadata::FileRecord;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    Modified,
    New,
    Deleted,
}

/// Result of diffing one scan against the manifest
#[derive(Debug, Default)]
pub struct DiffPlan {
    /// Paths whose latest version is still current
    pub unchanged: Vec<String>,
    /// New or modified files that need an artifact
    pub to_archive: Vec<(ChangeKind, FileRecord)>,
    /// Paths last seen Present that are gone from the scan
    pub deleted: Vec<String>,
    /// Unreadable records, excluded from comparison
    pub skipped: Vec<FileRecord>,
}

impl DiffPlan {
    pub fn count(&self, kind: ChangeKind) -> usize {
        match kind {
            ChangeKind::Unchanged => self.unchanged.len(),
            ChangeKind::Deleted => self.deleted.len(),
            ChangeKind::New | ChangeKind::Modified => {
                self.to_archive.iter().filter(|(k, _)| *k == kind).count()
            }
        }
    }

    /// True when a commit would add nothing.
    pub fn is_noop(&self) -> bool {
        self.to_archive.is_empty() && self.deleted.is_empty()
    }

    pub fn bytes_to_archive(&self) -> u64 {
        self.to_archive.iter().map(|(_, r)| r.size).sum()
    }
}

/// Classify one scanned record against the latest entry for its path.
pub fn classify(record: &FileRecord, latest: Option<&ManifestEntry>, verify_hash: bool) -> ChangeKind {
    let latest = match latest {
        Some(entry) if entry.is_present() => entry,
        _ => return ChangeKind::New,
    };

    if EntryKind::from(&record.kind) != latest.kind {
        return ChangeKind::Modified;
    }

    if verify_hash {
        if let (Some(current), Some(known)) = (&record.content_hash, &latest.content_hash) {
            return if current == known {
                ChangeKind::Unchanged
            } else {
                ChangeKind::Modified
            };
        }
    }

    if record.size == latest.size && record.mtime_us == latest.mtime_us {
        ChangeKind::Unchanged
    } else {
        ChangeKind::Modified
    }
}

/// Diff a full scan against `manifest`.
///
/// Known paths at or below an unreadable record are never reported as
/// deleted: a directory that could not be listed says nothing about its
/// children.
pub fn diff_against_manifest<I>(records: I, manifest: &Manifest, verify_hash: bool) -> DiffPlan
where
    I: IntoIterator<Item = FileRecord>,
{
    let mut plan = DiffPlan::default();
    let mut seen = HashSet::new();

    for record in records {
        if record.is_unreadable() {
            plan.skipped.push(record);
            continue;
        }
        if !seen.insert(record.relative_path.clone()) {
            continue;
        }

        match classify(&record, manifest.latest(&record.relative_path), verify_hash) {
            ChangeKind::Unchanged => plan.unchanged.push(record.relative_path),
            kind => plan.to_archive.push((kind, record)),
        }
    }

    let skipped_roots: Vec<&str> = plan
        .skipped
        .iter()
        .map(|r| r.relative_path.as_str())
        .collect();

    plan.deleted = manifest
        .latest_state()
        .filter(|(path, entry)| entry.is_present() && !seen.contains(*path))
        .filter(|(path, _)| !skipped_roots.iter().any(|root| is_within(path, root)))
        .map(|(path, _)| path.clone())
        .collect();

    plan
}

fn is_within(path: &str, root: &str) -> bool {
    root.is_empty()
        || path == root
        || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::EntryStatus;
    use crate::fs::metadata::RecordKind;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn file(rel: &str, size: u64, mtime_us: i64) -> FileRecord {
        FileRecord {
            relative_path: rel.to_string(),
            path: PathBuf::from("/data").join(rel),
            size,
            mtime_us,
            content_hash: None,
            kind: RecordKind::Regular,
        }
    }

    fn entry(version: u64, size: u64, mtime_us: i64) -> ManifestEntry {
        ManifestEntry {
            version,
            timestamp: Utc.timestamp_opt(1_700_000_000 + version as i64, 0).unwrap(),
            status: EntryStatus::Present,
            kind: EntryKind::File,
            artifact: Some(format!("v{}.gz", version)),
            size,
            mtime_us,
            content_hash: None,
        }
    }

    fn manifest_with(paths: &[(&str, u64, i64)]) -> Manifest {
        let mut manifest = Manifest::default();
        for (path, size, mtime) in paths {
            manifest.append(path, entry(1, *size, *mtime)).unwrap();
        }
        manifest
    }

    #[test]
    fn test_diff_files_against_manifest() {
        let manifest = manifest_with(&[
            ("file1.txt", 100, 1000),
            ("file2.txt", 200, 2000),
            ("deleted.txt", 50, 500),
        ]);

        let records = vec![
            file("file1.txt", 100, 1000),
            file("file2.txt", 250, 2000),
            file("new_file.txt", 300, 3000),
        ];

        let plan = diff_against_manifest(records, &manifest, false);

        assert_eq!(plan.unchanged, vec!["file1.txt"]);
        assert_eq!(plan.count(ChangeKind::Modified), 1);
        assert_eq!(plan.count(ChangeKind::New), 1);
        assert_eq!(plan.deleted, vec!["deleted.txt"]);
        assert_eq!(plan.bytes_to_archive(), 550);
    }

    #[test]
    fn test_mtime_change_is_modified() {
        let latest = entry(1, 10, 1000);
        assert_eq!(classify(&file("a", 10, 1001), Some(&latest), false), ChangeKind::Modified);
        assert_eq!(classify(&file("a", 10, 1000), Some(&latest), false), ChangeKind::Unchanged);
    }

    #[test]
    fn test_previously_deleted_is_new() {
        let previous = entry(1, 10, 1000);
        let tomb = ManifestEntry::tombstone(&previous, 2, previous.timestamp);
        assert_eq!(classify(&file("a", 10, 1000), Some(&tomb), false), ChangeKind::New);
        assert_eq!(classify(&file("a", 10, 1000), None, false), ChangeKind::New);
    }

    #[test]
    fn test_hash_overrides_attributes_when_verifying() {
        let mut latest = entry(1, 10, 1000);
        latest.content_hash = Some("abc".to_string());

        let mut touched = file("a", 10, 9999);
        touched.content_hash = Some("abc".to_string());
        assert_eq!(classify(&touched, Some(&latest), true), ChangeKind::Unchanged);
        assert_eq!(classify(&touched, Some(&latest), false), ChangeKind::Modified);

        let mut same_attrs = file("a", 10, 1000);
        same_attrs.content_hash = Some("def".to_string());
        assert_eq!(classify(&same_attrs, Some(&latest), true), ChangeKind::Modified);
        assert_eq!(classify(&same_attrs, Some(&latest), false), ChangeKind::Unchanged);
    }

    #[test]
    fn test_kind_change_is_modified() {
        let latest = entry(1, 6, 1000);
        let mut link = file("a", 6, 1000);
        link.kind = RecordKind::SymlinkLike {
            target: PathBuf::from("target"),
        };
        assert_eq!(classify(&link, Some(&latest), false), ChangeKind::Modified);
    }

    #[test]
    fn test_directory_records_compare_as_directories() {
        let mut dir = file(".git", 40, 5000);
        dir.kind = RecordKind::Directory;

        let mut latest = entry(1, 40, 5000);
        assert_eq!(classify(&dir, Some(&latest), false), ChangeKind::Modified);

        latest.kind = EntryKind::Directory;
        assert_eq!(classify(&dir, Some(&latest), false), ChangeKind::Unchanged);
        dir.mtime_us = 5001;
        assert_eq!(classify(&dir, Some(&latest), false), ChangeKind::Modified);
    }

    #[test]
    fn test_tombstoned_paths_are_not_deleted_again() {
        let mut manifest = manifest_with(&[("gone.txt", 1, 1)]);
        let previous = manifest.latest("gone.txt").unwrap().clone();
        let tomb = ManifestEntry::tombstone(
            &previous,
            2,
            previous.timestamp + chrono::Duration::seconds(1),
        );
        manifest.append("gone.txt", tomb).unwrap();

        let plan = diff_against_manifest(Vec::new(), &manifest, false);
        assert!(plan.deleted.is_empty());
        assert!(plan.is_noop());
    }

    #[test]
    fn test_unreadable_subtree_is_not_deleted() {
        let manifest = manifest_with(&[
            ("locked/a.txt", 1, 1),
            ("locked_sibling.txt", 1, 1),
            ("other.txt", 1, 1),
        ]);

        let records = vec![
            FileRecord::unreadable("locked".to_string(), PathBuf::from("/data/locked"), "denied"),
            file("other.txt", 1, 1),
        ];

        let plan = diff_against_manifest(records, &manifest, false);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.deleted, vec!["locked_sibling.txt"]);
        assert_eq!(plan.unchanged, vec!["other.txt"]);
    }

    #[test]
    fn test_unreadable_root_protects_everything() {
        let manifest = manifest_with(&[("a.txt", 1, 1)]);
        let records = vec![FileRecord::unreadable(String::new(), PathBuf::from("/data"), "denied")];

        let plan = diff_against_manifest(records, &manifest, false);
        assert!(plan.deleted.is_empty());
    }
}
