//! Compressed, timestamped artifacts.
//!
//! Each archived version of `rel/path` lands at
//! `<backup>/rel/path/<YYYYMMDDTHHMMSS.ffffffZ>.<ext>` and is written through
//! [`write_atomic`], so a partially written artifact is never visible under
//! its final name. Artifacts are immutable once written. Directories listed
//! in `scan.archive_dirs` are stored as one tar stream,
//! `<ts>.tar.gz` or `<ts>.tar.zst`.

use crate::config::META_DIR;
use crate::executor::manifest::EntryKind;
use crate::fs::atomic::{is_temp_name, write_atomic, Overwrite};
use crate::fs::metadata::{FileRecord, RecordKind};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Timestamp layout used in artifact file names (ISO 8601 basic format).
pub const ARTIFACT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zstd,
}

impl Codec {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gzip" | "gz" => Ok(Codec::Gzip),
            "zstd" | "zst" => Ok(Codec::Zstd),
            other => Err(BackupError::Config(format!(
                "Unknown compression method '{}'",
                other
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Codec::Gzip => "gz",
            Codec::Zstd => "zst",
        }
    }

    /// Codec of an existing artifact, from its extension.
    pub fn for_artifact(reference: &str) -> Option<Self> {
        match Path::new(reference).extension()?.to_str()? {
            "gz" => Some(Codec::Gzip),
            "zst" => Some(Codec::Zstd),
            _ => None,
        }
    }
}

/// `20260119T083012.123456Z`
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(ARTIFACT_TIME_FORMAT).to_string()
}

/// Result of archiving one file
#[derive(Debug, Clone)]
pub struct ArchivedFile {
    /// Artifact path relative to the backup root
    pub artifact: String,
    /// Uncompressed bytes fed to the compressor
    pub bytes_read: u64,
    /// Compressed size on disk
    pub stored_bytes: u64,
    /// Hex SHA-256 of the uncompressed content (the tar stream for directories)
    pub content_hash: String,
}

/// Writes artifacts into one backup root
#[derive(Debug, Clone)]
pub struct Archiver {
    backup_root: PathBuf,
    codec: Codec,
    level: i32,
}

impl Archiver {
    pub fn new(backup_root: impl Into<PathBuf>, codec: Codec, level: i32) -> Self {
        Self {
            backup_root: backup_root.into(),
            codec,
            level,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Artifact reference for `relative_path` archived at `ts`.
    pub fn artifact_reference(
        &self,
        relative_path: &str,
        kind: EntryKind,
        ts: DateTime<Utc>,
    ) -> Result<String> {
        let first = relative_path.split('/').next().unwrap_or_default();
        if first == META_DIR {
            return Err(BackupError::write(
                relative_path,
                format!("'{}' is reserved for backup metadata", META_DIR),
            ));
        }
        if relative_path.is_empty()
            || relative_path
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(BackupError::write(relative_path, "invalid relative path"));
        }
        let container = match kind {
            EntryKind::Directory => "tar.",
            EntryKind::File | EntryKind::Symlink => "",
        };
        Ok(format!(
            "{}/{}.{}{}",
            relative_path,
            format_timestamp(ts),
            container,
            self.codec.extension()
        ))
    }

    /// Newest run timestamp among the artifacts already stored for
    /// `relative_path`, referenced by the manifest or not.
    pub fn newest_artifact_time(&self, relative_path: &str) -> Option<DateTime<Utc>> {
        let entries = std::fs::read_dir(self.backup_root.join(relative_path)).ok()?;
        entries
            .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
            .filter(|name| !is_temp_name(name))
            .filter_map(|name| artifact_time(&name))
            .max()
    }

    /// Read, compress and atomically store the current content of `record`.
    pub fn archive(&self, record: &FileRecord, ts: DateTime<Utc>) -> Result<ArchivedFile> {
        let kind = EntryKind::from(&record.kind);
        let artifact = self.artifact_reference(&record.relative_path, kind, ts)?;
        let final_path = self.backup_root.join(&artifact);
        let codec = self.codec;
        let level = self.level;

        let source: Box<dyn Read> = match &record.kind {
            RecordKind::Regular => {
                let file = File::open(&record.path)
                    .map_err(|e| BackupError::read(&record.relative_path, e))?;
                Box::new(BufReader::new(file))
            }
            RecordKind::SymlinkLike { target } => {
                Box::new(Cursor::new(target.as_os_str().as_encoded_bytes().to_vec()))
            }
            RecordKind::Directory => {
                if let Err(e) = std::fs::read_dir(&record.path) {
                    return Err(BackupError::read(&record.relative_path, e));
                }
                let (bytes_read, content_hash) = write_atomic(&final_path, Overwrite::Never, |w| {
                    tar_into(codec, level, &record.path, w)
                })
                .map_err(|e| BackupError::write(&record.relative_path, e))?;
                return Ok(self.archived(record, artifact, bytes_read, content_hash));
            }
            RecordKind::Unreadable { reason } => {
                return Err(BackupError::read(&record.relative_path, reason));
            }
        };

        let (bytes_read, content_hash) = write_atomic(&final_path, Overwrite::Never, |w| {
            let mut source = HashingReader::new(source);
            compress_into(codec, level, &mut source, w)?;
            Ok(source.finish())
        })
        .map_err(|e| BackupError::write(&record.relative_path, e))?;

        if bytes_read != record.size {
            warn!(
                "{} changed during backup ({} bytes scanned, {} archived)",
                record.relative_path, record.size, bytes_read
            );
        }
        Ok(self.archived(record, artifact, bytes_read, content_hash))
    }

    fn archived(
        &self,
        record: &FileRecord,
        artifact: String,
        bytes_read: u64,
        content_hash: String,
    ) -> ArchivedFile {
        let stored_bytes = std::fs::metadata(self.backup_root.join(&artifact))
            .map(|m| m.len())
            .unwrap_or(0);
        debug!(
            "Archived {} -> {} ({} -> {} bytes)",
            record.relative_path, artifact, bytes_read, stored_bytes
        );
        ArchivedFile {
            artifact,
            bytes_read,
            stored_bytes,
            content_hash,
        }
    }
}

/// Run timestamp encoded in an artifact file name.
fn artifact_time(name: &str) -> Option<DateTime<Utc>> {
    let end = name.find('Z')?;
    NaiveDateTime::parse_from_str(&name[..=end], ARTIFACT_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Streaming compressor over either codec.
enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(codec: Codec, level: i32, dest: W) -> io::Result<Self> {
        Ok(match codec {
            Codec::Gzip => Encoder::Gzip(GzEncoder::new(
                dest,
                Compression::new(level.clamp(0, 9) as u32),
            )),
            Codec::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(dest, level)?),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(encoder) => encoder.finish(),
            Encoder::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(encoder) => encoder.write(buf),
            Encoder::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(encoder) => encoder.flush(),
            Encoder::Zstd(encoder) => encoder.flush(),
        }
    }
}

fn compress_into<R: Read, W: Write>(codec: Codec, level: i32, source: &mut R, dest: W) -> io::Result<u64> {
    let mut encoder = Encoder::new(codec, level, dest)?;
    let n = io::copy(source, &mut encoder)?;
    encoder.finish()?;
    Ok(n)
}

/// Write `dir` as a compressed tar stream whose single top-level entry is
/// the directory's own name. Symlinks inside are stored, not followed.
/// Returns the uncompressed stream length and its hex SHA-256.
fn tar_into<W: Write>(codec: Codec, level: i32, dir: &Path, dest: W) -> io::Result<(u64, String)> {
    let name = dir
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;

    let encoder = Encoder::new(codec, level, dest)?;
    let mut builder = tar::Builder::new(HashingWriter::new(encoder));
    builder.follow_symlinks(false);
    builder.append_dir_all(name, dir)?;

    let (bytes, hash, encoder) = builder.into_inner()?.finish();
    encoder.finish()?;
    Ok((bytes, hash))
}

/// Open an artifact for reading its decompressed content.
pub fn open_artifact(backup_root: &Path, reference: &str) -> Result<Box<dyn Read>> {
    let codec = Codec::for_artifact(reference).ok_or_else(|| {
        BackupError::ArtifactMissing(format!("{} has no known compression extension", reference))
    })?;
    let path = backup_root.join(reference);
    let file = match File::open(&path) {
        Ok(file) => BufReader::new(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::ArtifactMissing(reference.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    Ok(match codec {
        Codec::Gzip => Box::new(GzDecoder::new(file)),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(file)?),
    })
}

/// Decompress an artifact fully into memory.
pub fn read_artifact(backup_root: &Path, reference: &str) -> Result<Vec<u8>> {
    let mut reader = open_artifact(backup_root, reference)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

/// Reader adapter that digests and counts everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Byte count and hex SHA-256 of the data read so far.
    pub fn finish(self) -> (u64, String) {
        (self.bytes, format!("{:x}", self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Writer adapter that digests and counts everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, String, W) {
        (self.bytes, format!("{:x}", self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::hash_bytes;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 19, 8, 30, 12).unwrap()
    }

    fn record(root: &Path, rel: &str, content: &[u8]) -> FileRecord {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        let metadata = fs::metadata(&path).unwrap();
        FileRecord::regular(rel.to_string(), path, &metadata, false)
    }

    #[test]
    fn test_artifact_reference_layout() {
        let archiver = Archiver::new("/bkp", Codec::Gzip, 6);
        assert_eq!(
            archiver.artifact_reference("dir/a.txt", EntryKind::File, ts()).unwrap(),
            "dir/a.txt/20260119T083012.000000Z.gz"
        );

        let zstd = Archiver::new("/bkp", Codec::Zstd, 3);
        assert!(zstd.artifact_reference("a", EntryKind::File, ts()).unwrap().ends_with(".zst"));
        assert_eq!(
            zstd.artifact_reference("proj/.git", EntryKind::Directory, ts()).unwrap(),
            "proj/.git/20260119T083012.000000Z.tar.zst"
        );
    }

    #[test]
    fn test_reserved_and_invalid_paths() {
        let archiver = Archiver::new("/bkp", Codec::Gzip, 6);
        let err = archiver
            .artifact_reference(".autobkp/manifest.json", EntryKind::File, ts())
            .unwrap_err();
        assert!(matches!(err, BackupError::Write { .. }));
        assert!(archiver.artifact_reference("a/../b", EntryKind::File, ts()).is_err());
        assert!(archiver.artifact_reference("", EntryKind::File, ts()).is_err());
        assert!(archiver.artifact_reference("nested/.autobkp", EntryKind::File, ts()).is_ok());
    }

    #[test]
    fn test_archive_gzip() {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let rec = record(src.path(), "a.txt", b"hello");

        let archiver = Archiver::new(bkp.path(), Codec::Gzip, 6);
        let archived = archiver.archive(&rec, ts()).unwrap();

        assert_eq!(archived.artifact, "a.txt/20260119T083012.000000Z.gz");
        assert_eq!(archived.bytes_read, 5);
        assert_eq!(archived.content_hash, hash_bytes(b"hello"));
        assert!(archived.stored_bytes > 0);
        assert_eq!(read_artifact(bkp.path(), &archived.artifact).unwrap(), b"hello");
    }

    #[test]
    fn test_archive_zstd() {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let content = b"zstd content ".repeat(100);
        let rec = record(src.path(), "nested/dir/data.bin", &content);

        let archiver = Archiver::new(bkp.path(), Codec::Zstd, 3);
        let archived = archiver.archive(&rec, ts()).unwrap();

        assert_eq!(read_artifact(bkp.path(), &archived.artifact).unwrap(), content);
    }

    #[test]
    fn test_artifacts_are_immutable() {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let rec = record(src.path(), "a.txt", b"first");

        let archiver = Archiver::new(bkp.path(), Codec::Gzip, 6);
        let archived = archiver.archive(&rec, ts()).unwrap();

        fs::write(&rec.path, b"second").unwrap();
        let err = archiver.archive(&rec, ts()).unwrap_err();
        assert!(matches!(err, BackupError::Write { .. }));
        assert_eq!(read_artifact(bkp.path(), &archived.artifact).unwrap(), b"first");
    }

    #[test]
    fn test_vanished_source_is_read_error() {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let rec = record(src.path(), "gone.txt", b"x");
        fs::remove_file(&rec.path).unwrap();

        let archiver = Archiver::new(bkp.path(), Codec::Gzip, 6);
        let err = archiver.archive(&rec, ts()).unwrap_err();
        assert!(matches!(err, BackupError::Read { .. }));
        assert!(!bkp.path().join("gone.txt").exists());
    }

    #[test]
    fn test_archive_directory_as_tar() {
        let src = TempDir::new().unwrap();
        let bkp = TempDir::new().unwrap();
        let repo = src.path().join("proj/.git");
        fs::create_dir_all(repo.join("refs")).unwrap();
        fs::write(repo.join("HEAD"), b"ref: refs/heads/main").unwrap();
        fs::write(repo.join("refs/main"), b"0123abcd").unwrap();
        let rec = FileRecord::directory("proj/.git".to_string(), repo);

        let archiver = Archiver::new(bkp.path(), Codec::Gzip, 6);
        let archived = archiver.archive(&rec, ts()).unwrap();
        assert_eq!(archived.artifact, "proj/.git/20260119T083012.000000Z.tar.gz");

        let stream = read_artifact(bkp.path(), &archived.artifact).unwrap();
        assert_eq!(hash_bytes(&stream), archived.content_hash);
        assert_eq!(stream.len() as u64, archived.bytes_read);

        let mut tar = tar::Archive::new(Cursor::new(stream));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        names.sort();
        assert_eq!(names, vec![".git", ".git/HEAD", ".git/refs", ".git/refs/main"]);
    }

    #[test]
    fn test_newest_artifact_time_sees_unreferenced_files() {
        let bkp = TempDir::new().unwrap();
        let dir = bkp.path().join("a.txt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("20260119T083012.000000Z.gz"), b"").unwrap();
        fs::write(dir.join("20990101T000000.000000Z.gz"), b"").unwrap();
        fs::write(dir.join(".20991231T000000.000000Z.gz.tmp.1234"), b"").unwrap();
        fs::write(dir.join("notes"), b"").unwrap();

        let archiver = Archiver::new(bkp.path(), Codec::Gzip, 6);
        let newest = archiver.newest_artifact_time("a.txt").unwrap();
        assert_eq!(newest, Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap());
        assert!(archiver.newest_artifact_time("b.txt").is_none());
    }

    #[test]
    fn test_missing_artifact() {
        let bkp = TempDir::new().unwrap();
        let err = read_artifact(bkp.path(), "a.txt/20260119T083012.000000Z.gz").unwrap_err();
        assert!(matches!(err, BackupError::ArtifactMissing(_)));
    }
}
