//! Executes an [`UploadPlan`] for one local file against a storage backend.
//!
//! Large objects are never buffered whole: each part is copied from the
//! local object into its own short-lived staging file and streamed from
//! there.

use futures::StreamExt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{TaskError, until_cancelled};
use crate::models::container::Container;
use crate::models::metadata::ObjectMetadata;
use crate::models::multipart::{PartId, PartRange, UploadPlan};
use crate::services::artifact::LocalArtifact;
use crate::services::storage_service::{ByteStream, StorageBackend};

pub struct UploadStrategy<'a> {
    backend: &'a dyn StorageBackend,
    cancel: &'a CancellationToken,
    chunk_size: u64,
}

impl<'a> UploadStrategy<'a> {
    pub fn new(backend: &'a dyn StorageBackend, cancel: &'a CancellationToken, chunk_size: u64) -> Self {
        Self {
            backend,
            cancel,
            chunk_size,
        }
    }

    /// Choose a plan for `source` from its size and the backend limits, then
    /// carry it out. Returns the plan that was executed.
    pub async fn upload(
        &self,
        container: &Container,
        name: &str,
        source: &Path,
        size: u64,
        metadata: &ObjectMetadata,
    ) -> Result<UploadPlan, TaskError> {
        let plan = UploadPlan::choose(size, &self.backend.limits(), self.chunk_size)?;
        match &plan {
            UploadPlan::SingleShot => {
                self.single_shot(container, name, source, metadata).await?;
            }
            UploadPlan::MultiPart { part_size, parts } => {
                debug!(
                    "uploading {} in {} parts of {} bytes",
                    name,
                    parts.len(),
                    part_size
                );
                self.multi_part(container, name, source, parts, metadata)
                    .await?;
            }
        }
        Ok(plan)
    }

    async fn single_shot(
        &self,
        container: &Container,
        name: &str,
        source: &Path,
        metadata: &ObjectMetadata,
    ) -> Result<(), TaskError> {
        let body = open_body(source).await?;
        until_cancelled(
            self.cancel,
            self.backend
                .single_shot_upload(container, name, body, metadata),
        )
        .await
    }

    async fn multi_part(
        &self,
        container: &Container,
        name: &str,
        source: &Path,
        parts: &[PartRange],
        metadata: &ObjectMetadata,
    ) -> Result<(), TaskError> {
        let mut input = File::open(source).await?;
        let staging_path = staging_path_for(source);
        let mut part_ids = Vec::with_capacity(parts.len());

        for part in parts {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let staged = LocalArtifact::new(&staging_path);
            stage_part(&mut input, part, staged.path()).await?;

            let body = open_body(staged.path()).await?;
            let id = until_cancelled(
                self.cancel,
                self.backend
                    .upload_part(container, name, PartId::random(), body),
            )
            .await?;
            part_ids.push(id);

            staged.remove().await?;
        }

        until_cancelled(
            self.cancel,
            self.backend
                .commit_parts(container, name, &part_ids, metadata),
        )
        .await
    }
}

async fn open_body(path: &Path) -> io::Result<ByteStream> {
    let file = File::open(path).await?;
    Ok(ReaderStream::new(file).boxed())
}

fn staging_path_for(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Copy `part` out of `input` into a new file at `dest`.
async fn stage_part(input: &mut File, part: &PartRange, dest: &Path) -> io::Result<()> {
    input.seek(SeekFrom::Start(part.offset)).await?;
    let mut out = File::create(dest).await?;
    let copied = tokio::io::copy(&mut (&mut *input).take(part.len), &mut out).await?;
    if copied != part.len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "part {} ended after {} of {} bytes",
                part.index, copied, part.len
            ),
        ));
    }
    out.flush().await
}
