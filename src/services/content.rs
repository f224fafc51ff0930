//! Synthesizes object bodies as a lazy sequence of bounded chunks and writes
//! them to the task's local artifact.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::errors::TaskError;
use crate::models::MIB;
use crate::models::task::ContentMode;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * MIB;

/// One piece of synthesized content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// `n` logical zero bytes; never materialized unless asked.
    Zero(usize),
    Data(Bytes),
}

impl Chunk {
    pub fn len(&self) -> usize {
        match self {
            Self::Zero(n) => *n,
            Self::Data(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Zero(n) => Bytes::from(vec![0u8; *n]),
            Self::Data(bytes) => bytes.clone(),
        }
    }
}

/// Lazy, finite chunk sequence whose lengths sum to the requested size.
pub struct Chunks {
    remaining: u64,
    chunk_size: u64,
    mode: ContentMode,
    rng: StdRng,
}

impl Chunks {
    pub fn new(len: u64, chunk_size: u64, mode: ContentMode) -> Self {
        Self {
            remaining: len,
            chunk_size: chunk_size.max(1),
            mode,
            rng: StdRng::from_entropy(),
        }
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }
        let n = self.chunk_size.min(self.remaining) as usize;
        self.remaining -= n as u64;

        Some(match self.mode {
            ContentMode::Sparse => Chunk::Zero(n),
            ContentMode::Randomized => {
                let mut buf = vec![0u8; n];
                self.rng.fill_bytes(&mut buf);
                Chunk::Data(Bytes::from(buf))
            }
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.div_ceil(self.chunk_size) as usize;
        (n, Some(n))
    }
}

/// Write `chunks` to a fresh file at `path` and return the bytes written.
///
/// Zero chunks are skipped with a seek and the final `set_len` leaves them
/// as holes on filesystems with sparse allocation.
pub async fn write_object<I>(
    path: &Path,
    chunks: I,
    cancel: &CancellationToken,
) -> Result<u64, TaskError>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut file = File::create(path).await?;
    let mut written: u64 = 0;

    for chunk in chunks {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        match &chunk {
            Chunk::Zero(n) => {
                file.seek(SeekFrom::Current(*n as i64)).await?;
            }
            Chunk::Data(bytes) => file.write_all(bytes).await?,
        }
        written += chunk.len() as u64;
    }

    file.set_len(written).await?;
    file.flush().await?;
    Ok(written)
}
