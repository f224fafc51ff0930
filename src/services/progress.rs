//! Run-wide progress counters and throughput/ETA estimates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub completed_files: u64,
    pub total_files: u64,
    pub completed_bytes: u64,
    pub elapsed: Duration,
    /// Fraction complete in `[0, 1]`.
    pub percent: f64,
    /// Bits per second since the run started.
    pub throughput_bps: f64,
    /// Remaining time at the average per-file rate so far. `None` until a
    /// file completes.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn compute(completed_files: u64, total_files: u64, completed_bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let percent = if total_files == 0 {
            1.0
        } else {
            completed_files as f64 / total_files as f64
        };
        let throughput_bps = if secs > 0.0 {
            completed_bytes as f64 * 8.0 / secs
        } else {
            0.0
        };
        let eta = (completed_files > 0).then(|| {
            let remaining = total_files.saturating_sub(completed_files) as f64;
            Duration::from_secs_f64(secs / completed_files as f64 * remaining)
        });

        Self {
            completed_files,
            total_files,
            completed_bytes,
            elapsed,
            percent,
            throughput_bps,
            eta,
        }
    }
}

/// Shared counters updated by every file that finishes uploading.
#[derive(Debug)]
pub struct ProgressTracker {
    total_files: u64,
    report_interval: u64,
    completed_files: AtomicU64,
    completed_bytes: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total_files: u64, report_interval: u64) -> Self {
        Self {
            total_files,
            report_interval,
            completed_files: AtomicU64::new(0),
            completed_bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Count one completed file of `bytes`. Every `report_interval` files
    /// a snapshot is logged and returned.
    pub fn record(&self, bytes: u64) -> Option<ProgressSnapshot> {
        let bytes_total = self.completed_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let files = self.completed_files.fetch_add(1, Ordering::AcqRel) + 1;

        if self.report_interval == 0 || files % self.report_interval != 0 {
            return None;
        }

        let snapshot =
            ProgressSnapshot::compute(files, self.total_files, bytes_total, self.started.elapsed());
        info!(
            "Processed file {} of {} ({:.1}%) after {} ({}) estimated in {}",
            snapshot.completed_files,
            snapshot.total_files,
            snapshot.percent * 100.0,
            format_elapsed(snapshot.elapsed),
            format_throughput(snapshot.throughput_bps),
            snapshot
                .eta
                .map(format_elapsed)
                .unwrap_or_else(|| "-".to_string()),
        );
        Some(snapshot)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::compute(
            self.completed_files(),
            self.total_files,
            self.completed_bytes(),
            self.started.elapsed(),
        )
    }

    pub fn completed_files(&self) -> u64 {
        self.completed_files.load(Ordering::Acquire)
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// `ddd.hh:mm:ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:03}.{:02}:{:02}:{:02}",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

pub fn format_throughput(bits_per_sec: f64) -> String {
    format!("{:.2} Mbps", bits_per_sec / 1_000_000.0)
}
