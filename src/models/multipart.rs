//! Multi-part upload planning: backend limits, part identifiers, and the
//! size-driven choice between single-shot and staged uploads.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::TaskError;
use crate::models::MIB;

/// Size limits published by a storage backend.
///
/// `max_part_bytes * max_part_count` is the largest object the backend can
/// hold; anything below `max_single_shot_bytes` can go up in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadLimits {
    pub max_single_shot_bytes: u64,
    pub max_part_bytes: u64,
    pub max_part_count: u64,
}

impl UploadLimits {
    /// Block blob limits: 256 MiB single-shot, 4000 MiB parts, 50 000 parts.
    pub const BLOCK_BLOB: Self = Self {
        max_single_shot_bytes: 256 * MIB,
        max_part_bytes: 4000 * MIB,
        max_part_count: 50_000,
    };

    /// Largest object a multi-part upload can commit.
    pub fn capacity(&self) -> u64 {
        self.max_part_bytes.saturating_mul(self.max_part_count)
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self::BLOCK_BLOB
    }
}

/// Opaque identifier for a staged part.
///
/// Generated ids are the base64 form of a random UUID so every id within an
/// upload has the same length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartId(String);

impl PartId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous byte range of the source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// Position in upload order (0-based).
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// How an object will be transferred. Derived from the object size and
/// never changed once chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    SingleShot,
    MultiPart { part_size: u64, parts: Vec<PartRange> },
}

impl UploadPlan {
    /// Pick the upload protocol for an object of `size` bytes.
    ///
    /// Objects larger than the backend capacity are rejected outright.
    /// Objects strictly smaller than the single-shot limit go up in one
    /// call. Everything else is split into parts of
    /// `max(chunk_size, ceil(size / max_part_count))` bytes, never more than
    /// `max_part_bytes`; only the last part may be shorter.
    pub fn choose(size: u64, limits: &UploadLimits, chunk_size: u64) -> Result<Self, TaskError> {
        let capacity = limits.capacity();
        if size > capacity {
            return Err(TaskError::ObjectTooLarge { size, capacity });
        }

        if size < limits.max_single_shot_bytes {
            return Ok(Self::SingleShot);
        }

        let min_part = size.div_ceil(limits.max_part_count.max(1));
        let part_size = chunk_size
            .max(min_part)
            .min(limits.max_part_bytes)
            .max(1);

        let mut parts = Vec::with_capacity(size.div_ceil(part_size) as usize);
        let mut offset = 0;
        while offset < size {
            let len = part_size.min(size - offset);
            parts.push(PartRange {
                index: parts.len(),
                offset,
                len,
            });
            offset += len;
        }

        Ok(Self::MultiPart { part_size, parts })
    }

    pub fn part_count(&self) -> usize {
        match self {
            Self::SingleShot => 0,
            Self::MultiPart { parts, .. } => parts.len(),
        }
    }
}

/// A part staged against an object name but not yet committed.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StagedPart {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Container the part was staged into.
    pub container_id: Uuid,

    /// Object name the part belongs to.
    pub object_name: String,

    /// Client supplied part id.
    pub part_id: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Timestamp when this part was staged.
    pub staged_at: DateTime<Utc>,
}
