//! A single synthetic object to produce and upload.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::container::Container;

/// How object bodies are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Logically all-zero, written as holes where the filesystem allows.
    Sparse,
    /// Filled from a non-cryptographic random source.
    Randomized,
}

impl ContentMode {
    pub fn from_randomized(randomized: bool) -> Self {
        if randomized {
            Self::Randomized
        } else {
            Self::Sparse
        }
    }

    pub fn is_randomized(self) -> bool {
        matches!(self, Self::Randomized)
    }
}

/// One file of a run, built before dispatch so that the pipeline owns
/// everything it needs.
#[derive(Debug, Clone)]
pub struct FileTask {
    /// 0-based sequence number within the run.
    pub seq: usize,
    /// Container the object is uploaded into.
    pub container: Container,
    /// Generated object name, also used for the local artifact.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
}

impl FileTask {
    /// Build task `seq` of `total`.
    ///
    /// `containers` must be non-empty; the run refuses to start otherwise.
    pub fn new<R: Rng>(
        seq: usize,
        total: usize,
        containers: &[Container],
        min_size: u64,
        max_size: u64,
        rng: &mut R,
    ) -> Self {
        let index = container_index(total, seq, containers.len());
        Self {
            seq,
            container: containers[index].clone(),
            name: format!("{}.dat", Uuid::new_v4()),
            size: draw_size(min_size, max_size, rng),
        }
    }

    /// Where the task's transient copy lives.
    pub fn local_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.name)
    }
}

/// Round-robin container slot for task `seq`, counting down from `total`.
pub fn container_index(total: usize, seq: usize, container_count: usize) -> usize {
    total.saturating_sub(seq) % container_count
}

/// Uniform size in `[min, max)`; collapses to `min` when the range is empty.
pub fn draw_size<R: Rng>(min: u64, max: u64, rng: &mut R) -> u64 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}
