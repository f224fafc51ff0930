#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use datamaker::models::container::Container;
use datamaker::models::metadata::{FILE_NUM, ObjectMetadata};
use datamaker::models::multipart::{PartId, UploadLimits};
use datamaker::services::storage_service::{ByteStream, LocalStore, StorageBackend, StorageError, StorageResult};
use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SMALL_LIMITS: UploadLimits = UploadLimits {
    max_single_shot_bytes: 100,
    max_part_bytes: 40,
    max_part_count: 10,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureContainer(String),
    SingleShot { container: String, name: String, size: usize },
    UploadPart { name: String, part_id: PartId, size: usize },
    Commit { name: String, parts: Vec<PartId> },
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub metadata: ObjectMetadata,
}

/// In-memory backend that records every call and the peak number of
/// concurrent uploads.
pub struct RecordingBackend {
    limits: UploadLimits,
    delay: Duration,
    fail_part: Option<usize>,
    fail_file_num: Option<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
    cancel_on_part: Option<(usize, CancellationToken)>,

    calls: Mutex<Vec<Call>>,
    containers: Mutex<HashMap<String, Container>>,
    parts: Mutex<HashMap<PartId, Vec<u8>>>,
    objects: Mutex<HashMap<(String, String), StoredBlob>>,

    part_calls: AtomicUsize,
    successes: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingBackend {
    pub fn new(limits: UploadLimits) -> Self {
        Self {
            limits,
            delay: Duration::ZERO,
            fail_part: None,
            fail_file_num: None,
            cancel_after: None,
            cancel_on_part: None,
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            parts: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            part_calls: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the `n`th (0-based) `upload_part` call.
    pub fn failing_part(mut self, n: usize) -> Self {
        self.fail_part = Some(n);
        self
    }

    /// Fail the upload of the file whose `FileNum` metadata is `n`.
    pub fn failing_file(mut self, n: usize) -> Self {
        self.fail_file_num = Some(n);
        self
    }

    /// Cancel `token` once `n` objects have been stored. Uploads started
    /// after that never finish.
    pub fn cancelling_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    /// Cancel `token` once `n` parts have been staged. Calls made after that
    /// never finish.
    pub fn cancelling_after_parts(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_on_part = Some((n, token));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn objects(&self) -> HashMap<(String, String), StoredBlob> {
        self.objects.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn enter(&self) {
        if let Some((n, _)) = &self.cancel_after
            && self.successes.load(Ordering::SeqCst) >= *n
        {
            futures::future::pending::<()>().await;
        }
        if let Some((_, token)) = &self.cancel_on_part
            && token.is_cancelled()
        {
            futures::future::pending::<()>().await;
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn stored(&self) {
        let done = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = &self.cancel_after
            && done == *n
        {
            token.cancel();
        }
    }

    fn injected_file_failure(&self, metadata: &ObjectMetadata) -> bool {
        self.fail_file_num
            .is_some_and(|n| metadata.get(FILE_NUM) == Some(n.to_string().as_str()))
    }
}

async fn collect(mut body: ByteStream) -> StorageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(bytes)
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn limits(&self) -> UploadLimits {
        self.limits
    }

    async fn ensure_container(&self, name: &str) -> StorageResult<Container> {
        self.record(Call::EnsureContainer(name.to_string()));
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .entry(name.to_string())
            .or_insert_with(|| Container {
                id: Uuid::new_v4(),
                name: name.to_string(),
                created_at: Utc::now(),
            });
        Ok(container.clone())
    }

    async fn single_shot_upload(
        &self,
        container: &Container,
        name: &str,
        body: ByteStream,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        self.enter().await;
        let bytes = collect(body).await;
        self.leave();
        let bytes = bytes?;

        self.record(Call::SingleShot {
            container: container.name.clone(),
            name: name.to_string(),
            size: bytes.len(),
        });
        if self.injected_file_failure(metadata) {
            return Err(injected("upload"));
        }
        self.objects.lock().unwrap().insert(
            (container.name.clone(), name.to_string()),
            StoredBlob {
                bytes,
                metadata: metadata.clone(),
            },
        );
        self.stored();
        Ok(())
    }

    async fn upload_part(
        &self,
        _container: &Container,
        name: &str,
        part_id: PartId,
        body: ByteStream,
    ) -> StorageResult<PartId> {
        self.enter().await;
        let bytes = collect(body).await;
        self.leave();
        let bytes = bytes?;

        self.record(Call::UploadPart {
            name: name.to_string(),
            part_id: part_id.clone(),
            size: bytes.len(),
        });
        let n = self.part_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_part == Some(n) {
            return Err(injected("part"));
        }
        self.parts.lock().unwrap().insert(part_id.clone(), bytes);
        if let Some((after, token)) = &self.cancel_on_part
            && n + 1 == *after
        {
            token.cancel();
        }
        Ok(part_id)
    }

    async fn commit_parts(
        &self,
        container: &Container,
        name: &str,
        parts: &[PartId],
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        self.record(Call::Commit {
            name: name.to_string(),
            parts: parts.to_vec(),
        });
        let staged = self.parts.lock().unwrap();
        let mut bytes = Vec::new();
        for part in parts {
            let data = staged
                .get(part)
                .ok_or_else(|| StorageError::InvalidPartList(format!("unknown part {part}")))?;
            bytes.extend_from_slice(data);
        }
        drop(staged);

        self.objects.lock().unwrap().insert(
            (container.name.clone(), name.to_string()),
            StoredBlob {
                bytes,
                metadata: metadata.clone(),
            },
        );
        self.stored();
        Ok(())
    }
}

/// A `LocalStore` over an in-memory database rooted at `dir`.
pub async fn local_store(dir: &Path, limits: UploadLimits) -> LocalStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = LocalStore::new(Arc::new(pool), dir).with_limits(limits);
    store.migrate().await.unwrap();
    store
}

/// Files left behind in `dir`.
pub fn leftover_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}
