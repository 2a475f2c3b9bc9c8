//! Directory traversal producing `FileRecord`s.
//!
//! The scan is lazy: records are produced while walking. Calling
//! [`Scanner::scan`] again starts a fresh walk, so a scanner can be reused
//! across runs. Symbolic links are recorded but never followed. Entries that
//! cannot be read become `Unreadable` records instead of aborting the walk.
//! Directories matching `archive_dirs` are not descended into; each one
//! becomes a single `Directory` record.

use crate::fs::metadata::FileRecord;
use crate::fs::pattern::PatternSet;
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, FilterEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Only files matching one of these are recorded (empty = all)
    pub include_patterns: Vec<String>,

    /// Files and directories matching any of these are pruned
    pub exclude_patterns: Vec<String>,

    /// Directories matching any of these are recorded as one unit
    pub archive_dirs: Vec<String>,

    /// Compute a SHA-256 content hash for every record
    pub hash_contents: bool,
}

/// Walks one source root
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    include: PatternSet,
    exclude: PatternSet,
    archive_dirs: PatternSet,
    hash_contents: bool,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, options: WalkOptions) -> Result<Self> {
        let compile = |patterns: &[String]| {
            PatternSet::new(patterns)
                .map_err(|e| BackupError::Config(format!("Invalid pattern: {}", e)))
        };

        Ok(Self {
            root: root.into(),
            include: compile(options.include_patterns.as_slice())?,
            exclude: compile(options.exclude_patterns.as_slice())?,
            archive_dirs: compile(options.archive_dirs.as_slice())?,
            hash_contents: options.hash_contents,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new walk over the source root.
    pub fn scan(&self) -> Scan<'_> {
        let root = self.root.clone();
        let exclude = self.exclude.clone();
        let keep: EntryFilter =
            Box::new(move |entry: &DirEntry| !is_excluded(entry, &root, &exclude));
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep);

        Scan {
            scanner: self,
            inner: walker,
        }
    }

    /// True for a directory below the root that is archived as one unit.
    fn is_archive_dir(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() || self.archive_dirs.is_empty() {
            return false;
        }
        let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
        self.archive_dirs.matches(relative)
    }

    /// Convert one walk result into a record, or `None` for entries that are
    /// not recorded (directories, special files, non-included files).
    fn record_for(&self, entry: walkdir::Result<DirEntry>) -> Option<FileRecord> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone());
                let relative = relative_key(&self.root, &path).unwrap_or_default();
                return Some(FileRecord::unreadable(relative, path, err.to_string()));
            }
        };

        let file_type = entry.file_type();
        let archive_dir = self.is_archive_dir(&entry);
        if file_type.is_dir() && !archive_dir {
            return None;
        }

        let path = entry.path().to_path_buf();
        let relative = match relative_key(&self.root, &path) {
            Some(relative) => relative,
            None => {
                let lossy = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                return Some(FileRecord::unreadable(lossy, path, "path is not valid UTF-8"));
            }
        };

        if !self.include.is_empty() && !self.include.matches(Path::new(&relative)) {
            return None;
        }

        if archive_dir {
            return Some(FileRecord::directory(relative, path));
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => return Some(FileRecord::unreadable(relative, path, err.to_string())),
        };

        if file_type.is_symlink() {
            Some(FileRecord::symlink(relative, path, &metadata, self.hash_contents))
        } else if file_type.is_file() {
            Some(FileRecord::regular(relative, path, &metadata, self.hash_contents))
        } else {
            debug!("Ignoring special file: {}", path.display());
            None
        }
    }
}

type EntryFilter = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Iterator over the records of one walk
pub struct Scan<'a> {
    scanner: &'a Scanner,
    inner: FilterEntry<walkdir::IntoIter, EntryFilter>,
}

impl Iterator for Scan<'_> {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        loop {
            let entry = self.inner.next()?;
            if entry.as_ref().is_ok_and(|e| self.scanner.is_archive_dir(e)) {
                self.inner.skip_current_dir();
            }
            if let Some(record) = self.scanner.record_for(entry) {
                return Some(record);
            }
        }
    }
}

/// `/`-joined path relative to `root`; `None` if any component is not UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|parts| parts.join("/"))
}

fn is_excluded(entry: &DirEntry, root: &Path, exclude: &PatternSet) -> bool {
    if entry.depth() == 0 || exclude.is_empty() {
        return false;
    }
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    exclude.matches(relative)
}
