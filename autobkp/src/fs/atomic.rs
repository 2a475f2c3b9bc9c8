//! Atomic file writes: temp file in the destination directory, flush,
//! fsync, then rename into place.
//!
//! A file is never visible under its final name until it is complete. A
//! crash in between leaves only a `.<name>.tmp.<id>` orphan next to it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether an existing file at the destination may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Fail with `AlreadyExists` (immutable artifacts)
    Never,
    /// Replace atomically (manifest)
    Replace,
}

/// Temp path used while writing `final_path`.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = uuid::Uuid::new_v4().simple();
    final_path.with_file_name(format!(".{}.tmp.{}", name, id))
}

/// True if `name` looks like a temp file left by `write_atomic`.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

/// Write `final_path` through `write`, which receives a buffered writer over
/// the temp file. Parent directories are created as needed.
pub fn write_atomic<T, F>(final_path: &Path, overwrite: Overwrite, write: F) -> io::Result<T>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<T>,
{
    let parent = final_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    if overwrite == Overwrite::Never && final_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", final_path.display()),
        ));
    }

    let temp_path = temp_path_for(final_path);
    let result = write_and_rename(&temp_path, final_path, write);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    let value = result?;

    sync_dir(parent);
    Ok(value)
}

fn write_and_rename<T, F>(temp_path: &Path, final_path: &Path, write: F) -> io::Result<T>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<T>,
{
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(file);

    let value = write(&mut writer)?;

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp_path, final_path)?;
    Ok(value)
}

/// Persist the rename itself. Not every platform can open a directory, so
/// failures are only logged.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Directory fsync failed for {}: {}", dir.display(), e);
    }

    #[cfg(not(unix))]
    let _ = dir;
}
