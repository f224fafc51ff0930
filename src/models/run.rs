//! Run-scoped values: the immutable parameters of a batch, its lifecycle
//! state, and the summary returned when it ends.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::task::ContentMode;

/// Parameters of one batch run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub file_count: usize,
    /// Maximum number of file pipelines in flight at once (at least 1).
    pub concurrency: usize,
    pub min_file_bytes: u64,
    pub max_file_bytes: u64,
    /// Emit a progress line every this many completed files; 0 disables.
    pub report_interval: u64,
    pub content_mode: ContentMode,
    /// Synthesis chunk size and minimum multi-part size.
    pub chunk_size: u64,
    /// Directory holding transient local copies.
    pub work_dir: PathBuf,
}

/// Lifecycle of a run: `Idle -> Running -> (Completed | Cancelled | Faulted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Faulted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Faulted)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Faulted)
        )
    }
}

/// Outcome of a finished (or cancelled) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub total_files: usize,
    pub dispatched_files: usize,
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub elapsed: Duration,
    /// Aggregate throughput in bits per second.
    pub throughput_bps: f64,
}

impl RunSummary {
    /// Files that were dispatched but did not finish uploading.
    pub fn incomplete_files(&self) -> usize {
        self.dispatched_files
            .saturating_sub(self.completed_files as usize)
    }
}
