//! Byte-level progress tracking for archive passes.
//!
//! Worker tasks record completed files into a shared [`ArchiveProgress`];
//! a reporter task samples it on an interval and logs throughput and ETA.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Point-in-time view of an archive pass
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Total bytes to archive
    pub total_bytes: u64,

    /// Bytes archived so far
    pub archived_bytes: u64,

    /// Current speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Number of files processed (archived or failed)
    pub files_processed: usize,

    /// Total number of files
    pub total_files: usize,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.files_processed >= self.total_files
    }
}

/// Counters shared between archive workers
#[derive(Debug)]
pub struct ArchiveProgress {
    total_bytes: u64,
    total_files: usize,
    archived_bytes: AtomicU64,
    files_processed: AtomicUsize,
    start_time: Instant,
}

impl ArchiveProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            total_files,
            archived_bytes: AtomicU64::new(0),
            files_processed: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one finished file. Failed files pass `bytes = 0`.
    pub fn file_done(&self, bytes: u64) {
        self.archived_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.archived_bytes.load(Ordering::Relaxed) as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let archived_bytes = self.archived_bytes.load(Ordering::Relaxed);
        let bytes_per_second = self.average_speed();

        let percent_complete = if self.total_bytes > 0 {
            ((archived_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_files == 0 {
            100.0
        } else {
            0.0
        };

        let eta_seconds = if bytes_per_second > 0 {
            self.total_bytes.saturating_sub(archived_bytes) / bytes_per_second
        } else {
            0
        };

        ProgressSnapshot {
            total_bytes: self.total_bytes,
            archived_bytes,
            bytes_per_second,
            eta_seconds,
            percent_complete,
            files_processed: self.files_processed.load(Ordering::Relaxed),
            total_files: self.total_files,
        }
    }
}

/// Log progress every `interval` until `stop` fires.
pub fn spawn_reporter(
    progress: Arc<ArchiveProgress>,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => break,
            }

            let snap = progress.snapshot();
            info!(
                "Archived {}/{} files, {} of {} ({:.1}%), {}, ETA {}",
                snap.files_processed,
                snap.total_files,
                format_bytes(snap.archived_bytes),
                format_bytes(snap.total_bytes),
                snap.percent_complete,
                format_speed(snap.bytes_per_second),
                format_duration(snap.eta_seconds)
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
