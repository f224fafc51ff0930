//! src/services/storage_service.rs
//!
//! The storage backend seam used by the upload pipeline, plus `LocalStore`,
//! a backend that keeps durable bookkeeping in SQLite and object payloads on
//! local disk sharded beneath `base_path/{container}/{shard}/{shard}/{name}`.
//! `LocalStore` speaks the same protocol as a block blob service: one-call
//! uploads below a size limit, otherwise staged parts committed by an
//! ordered id list.

use crate::models::{
    container::Container,
    metadata::{MetadataEntry, ObjectMetadata},
    multipart::{PartId, StagedPart, UploadLimits},
    object::StoredObject,
};
use crate::services::artifact::LocalArtifact;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Request body handed to a backend.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("object `{name}` not found in container `{container}`")]
    ObjectNotFound { container: String, name: String },
    #[error("invalid object name")]
    InvalidObjectName,
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("invalid part list: {0}")]
    InvalidPartList(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object store operations the upload pipeline relies on.
///
/// Implementations are shared by every in-flight file, so they must be
/// safe to call concurrently. Retries, if any, belong here rather than in
/// the caller.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Size limits that decide between single-shot and multi-part uploads.
    fn limits(&self) -> UploadLimits;

    /// Return the named container, creating it if it does not exist yet.
    async fn ensure_container(&self, name: &str) -> StorageResult<Container>;

    /// Upload a whole object in one request.
    async fn single_shot_upload(
        &self,
        container: &Container,
        name: &str,
        body: ByteStream,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()>;

    /// Stage one part of `name`. Returns the id to pass to `commit_parts`.
    async fn upload_part(
        &self,
        container: &Container,
        name: &str,
        part_id: PartId,
        body: ByteStream,
    ) -> StorageResult<PartId>;

    /// Atomically materialize `name` from staged parts, in the given order.
    async fn commit_parts(
        &self,
        container: &Container,
        name: &str,
        parts: &[PartId],
        metadata: &ObjectMetadata,
    ) -> StorageResult<()>;
}

/// Disk + SQLite implementation of [`StorageBackend`].
#[derive(Clone)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for bookkeeping.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    limits: UploadLimits,
}

const MAX_OBJECT_NAME_LEN: usize = 1024;
const CONTAINER_NAME_MAX_LEN: usize = 63;
const COPY_BUFFER_BYTES: usize = 1024 * 1024;
const STAGING_DIR: &str = ".staging";
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

impl LocalStore {
    /// Create a store backed by the provided SQLite pool and using
    /// `base_path` as the root directory for payloads. Block blob limits
    /// apply until overridden with [`LocalStore::with_limits`].
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            limits: UploadLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Create the bookkeeping tables if they do not exist yet.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Reject names that could escape the container directory.
    fn ensure_name_safe(&self, name: &str) -> StorageResult<()> {
        if name.is_empty() || name.len() > MAX_OBJECT_NAME_LEN {
            return Err(StorageError::InvalidObjectName);
        }
        if name.starts_with('/') || name.starts_with('.') || name.contains("..") {
            return Err(StorageError::InvalidObjectName);
        }
        if name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectName);
        }
        Ok(())
    }

    /// Validate container name format.
    ///
    /// - 1–63 characters
    /// - lowercase letters, digits and hyphens only
    /// - cannot start or end with a hyphen, or contain `--`
    fn ensure_container_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim() != name {
            return Err(invalid("cannot begin or end with whitespace"));
        }
        if name.is_empty() || name.len() > CONTAINER_NAME_MAX_LEN {
            return Err(invalid("must be between 1 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, and hyphens",
            ));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must start and end with a letter or digit"));
        }
        if name.contains("--") {
            return Err(invalid("cannot contain consecutive hyphens"));
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Two-level shard directories from MD5(container/name).
    fn object_shards(container: &str, name: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: &str, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, name);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn staging_dir(&self, container: &str, name: &str) -> PathBuf {
        self.container_root(container)
            .join(STAGING_DIR)
            .join(format!("{:x}", md5::compute(name)))
    }

    /// Part ids are base64 and may contain `/`, so they are hashed into
    /// file names.
    fn staged_part_path(&self, container: &str, name: &str, part_id: &PartId) -> PathBuf {
        self.staging_dir(container, name)
            .join(format!("{:x}.part", md5::compute(part_id.as_str())))
    }

    async fn fetch_container(&self, name: &str) -> StorageResult<Container> {
        sqlx::query_as::<_, Container>(
            "SELECT id, name, created_at FROM containers WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ContainerNotFound(name.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_object(&self, container: &Container, name: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT id, container_id, name, size_bytes, etag, last_modified
             FROM objects
             WHERE container_id = ? AND name = ?",
        )
        .bind(container.id)
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                container: container.name.clone(),
                name: name.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    async fn staged_parts(&self, container: &Container, name: &str) -> StorageResult<Vec<StagedPart>> {
        let parts = sqlx::query_as::<_, StagedPart>(
            "SELECT id, container_id, object_name, part_id, size_bytes, staged_at
             FROM staged_parts
             WHERE container_id = ? AND object_name = ?
             ORDER BY staged_at ASC",
        )
        .bind(container.id)
        .bind(name)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    /// Allocate a temp file path next to `dest`, creating parents as needed.
    async fn temp_path_for(dest: &Path) -> StorageResult<PathBuf> {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "payload path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        Ok(parent.join(format!(".tmp-{}", Uuid::new_v4())))
    }

    /// Move a filled temp file into place, or remove it if filling failed.
    /// The guard removes `tmp` on every early return, and also when the
    /// calling future is dropped before this point.
    async fn settle<T>(tmp: LocalArtifact, dest: &Path, filled: StorageResult<T>) -> StorageResult<T> {
        let value = match filled {
            Ok(value) => value,
            Err(err) => {
                let _ = tmp.remove().await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(tmp.path(), dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(tmp.path(), dest).await?;
            } else {
                return Err(StorageError::Io(err));
            }
        }
        tmp.disarm();
        Ok(value)
    }

    /// Stream `body` into `tmp`, returning size and hex MD5. Fails once more
    /// than `limit` bytes arrive.
    async fn fill_from_stream(
        tmp: &Path,
        mut body: ByteStream,
        limit: u64,
    ) -> StorageResult<(u64, String)> {
        let mut file = File::create(tmp).await?;
        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if size > limit {
                return Err(StorageError::PayloadTooLarge { limit });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size, format!("{:x}", digest.compute())))
    }

    /// Concatenate `sources` into `tmp` in order.
    async fn fill_from_parts(tmp: &Path, sources: &[PathBuf]) -> StorageResult<(u64, String)> {
        let mut out = File::create(tmp).await?;
        let mut size: u64 = 0;
        let mut digest = Context::new();
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        for source in sources {
            let mut input = File::open(source).await?;
            loop {
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buffer[..n]);
                out.write_all(&buffer[..n]).await?;
                size += n as u64;
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok((size, format!("{:x}", digest.compute())))
    }

    async fn write_stream(&self, dest: &Path, body: ByteStream, limit: u64) -> StorageResult<(u64, String)> {
        let tmp = LocalArtifact::new(Self::temp_path_for(dest).await?);
        let filled = Self::fill_from_stream(tmp.path(), body, limit).await;
        Self::settle(tmp, dest, filled).await
    }

    /// Upsert the object row and replace its metadata in one transaction.
    async fn record_object(
        &self,
        container: &Container,
        name: &str,
        size: u64,
        etag: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<StoredObject> {
        let mut tx = self.db.begin().await?;

        let object = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (id, container_id, name, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(container_id, name) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, container_id, name, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container.id)
        .bind(name)
        .bind(size as i64)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;

        for (key, value) in metadata.iter() {
            sqlx::query(
                "INSERT INTO object_metadata (id, object_id, key, value) VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(object.id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(object)
    }

    /// Record a payload already in place at `dest`; drop the payload if
    /// the bookkeeping fails so disk and database stay consistent.
    async fn finish_object(
        &self,
        container: &Container,
        name: &str,
        dest: &Path,
        size: u64,
        etag: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<StoredObject> {
        match self.record_object(container, name, size, etag, metadata).await {
            Ok(object) => Ok(object),
            Err(err) => {
                let _ = fs::remove_file(dest).await;
                Err(err)
            }
        }
    }

    /// Forget every staged part of `name`, committed or not.
    async fn discard_staged(&self, container: &Container, name: &str) {
        if let Err(err) =
            sqlx::query("DELETE FROM staged_parts WHERE container_id = ? AND object_name = ?")
                .bind(container.id)
                .bind(name)
                .execute(&*self.db)
                .await
        {
            debug!("failed to clear staged part rows for {}: {}", name, err);
        }

        let dir = self.staging_dir(&container.name, name);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove staging directory {}: {}", dir.display(), err);
            }
        }
    }

    /// Fetch a committed object and its metadata.
    pub async fn get_object_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> StorageResult<(StoredObject, ObjectMetadata)> {
        self.ensure_name_safe(name)?;
        let container = self.fetch_container(container).await?;
        let object = self.fetch_object(&container, name).await?;

        let entries = sqlx::query_as::<_, MetadataEntry>(
            "SELECT id, object_id, key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;

        let metadata = entries.into_iter().map(|e| (e.key, e.value)).collect();
        Ok((object, metadata))
    }

    /// Open a committed object for reading.
    pub async fn get_object_reader(
        &self,
        container: &str,
        name: &str,
    ) -> StorageResult<(StoredObject, File)> {
        self.ensure_name_safe(name)?;
        let container = self.fetch_container(container).await?;
        let object = self.fetch_object(&container, name).await?;

        let file = File::open(self.object_path(&container.name, name))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ObjectNotFound {
                        container: container.name.clone(),
                        name: name.to_string(),
                    }
                } else {
                    StorageError::Io(err)
                }
            })?;

        Ok((object, file))
    }

    /// All committed objects in a container, ordered by name.
    pub async fn list_objects(&self, container: &str) -> StorageResult<Vec<StoredObject>> {
        let container = self.fetch_container(container).await?;
        let objects = sqlx::query_as::<_, StoredObject>(
            "SELECT id, container_id, name, size_bytes, etag, last_modified
             FROM objects WHERE container_id = ? ORDER BY name ASC",
        )
        .bind(container.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(objects)
    }
}

#[async_trait]
impl StorageBackend for LocalStore {
    fn limits(&self) -> UploadLimits {
        self.limits
    }

    async fn ensure_container(&self, name: &str) -> StorageResult<Container> {
        self.ensure_container_name_safe(name)?;
        fs::create_dir_all(self.container_root(name)).await?;

        let inserted = sqlx::query(
            "INSERT INTO containers (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!("created container {}", name);
        }
        self.fetch_container(name).await
    }

    async fn single_shot_upload(
        &self,
        container: &Container,
        name: &str,
        body: ByteStream,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        self.ensure_name_safe(name)?;
        let container = self.fetch_container(&container.name).await?;

        let dest = self.object_path(&container.name, name);
        let (size, etag) = self
            .write_stream(&dest, body, self.limits.max_single_shot_bytes)
            .await?;
        self.finish_object(&container, name, &dest, size, &etag, metadata)
            .await?;

        debug!("stored {} ({} bytes) in one request", name, size);
        Ok(())
    }

    async fn upload_part(
        &self,
        container: &Container,
        name: &str,
        part_id: PartId,
        body: ByteStream,
    ) -> StorageResult<PartId> {
        self.ensure_name_safe(name)?;
        let container = self.fetch_container(&container.name).await?;

        let path = self.staged_part_path(&container.name, name, &part_id);
        let (size, _) = self
            .write_stream(&path, body, self.limits.max_part_bytes)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO staged_parts (id, container_id, object_name, part_id, size_bytes, staged_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(container_id, object_name, part_id) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                staged_at = excluded.staged_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container.id)
        .bind(name)
        .bind(part_id.as_str())
        .bind(size as i64)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        debug!("staged part {} of {} ({} bytes)", part_id, name, size);
        Ok(part_id)
    }

    async fn commit_parts(
        &self,
        container: &Container,
        name: &str,
        parts: &[PartId],
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        self.ensure_name_safe(name)?;
        let container = self.fetch_container(&container.name).await?;

        if parts.len() as u64 > self.limits.max_part_count {
            return Err(StorageError::InvalidPartList(format!(
                "{} parts exceeds the limit of {}",
                parts.len(),
                self.limits.max_part_count
            )));
        }

        let mut seen = HashSet::with_capacity(parts.len());
        for part in parts {
            if !seen.insert(part) {
                return Err(StorageError::InvalidPartList(format!(
                    "duplicate part id `{}`",
                    part
                )));
            }
        }

        let staged: HashMap<String, StagedPart> = self
            .staged_parts(&container, name)
            .await?
            .into_iter()
            .map(|p| (p.part_id.clone(), p))
            .collect();

        let mut sources = Vec::with_capacity(parts.len());
        for part in parts {
            if !staged.contains_key(part.as_str()) {
                return Err(StorageError::InvalidPartList(format!(
                    "part `{}` was never staged",
                    part
                )));
            }
            sources.push(self.staged_part_path(&container.name, name, part));
        }

        let dest = self.object_path(&container.name, name);
        let tmp = LocalArtifact::new(Self::temp_path_for(&dest).await?);
        let filled = Self::fill_from_parts(tmp.path(), &sources).await;
        let (size, etag) = Self::settle(tmp, &dest, filled).await?;
        self.finish_object(&container, name, &dest, size, &etag, metadata)
            .await?;

        self.discard_staged(&container, name).await;
        debug!("committed {} from {} parts ({} bytes)", name, parts.len(), size);
        Ok(())
    }
}
