mod common;

use chrono::Utc;
use common::{Call, RecordingBackend, SMALL_LIMITS};
use datamaker::errors::TaskError;
use datamaker::models::container::Container;
use datamaker::models::metadata::{MD5_HASH, ObjectMetadata};
use datamaker::models::multipart::UploadPlan;
use datamaker::services::upload::UploadStrategy;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn container() -> Container {
    Container {
        id: Uuid::new_v4(),
        name: "uploads".to_string(),
        created_at: Utc::now(),
    }
}

fn source(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join("object.dat");
    std::fs::write(&path, &bytes).unwrap();
    (path, bytes)
}

fn metadata() -> ObjectMetadata {
    let mut metadata = ObjectMetadata::new();
    metadata.insert(MD5_HASH, "unused");
    metadata
}

#[tokio::test]
async fn oversized_object_makes_no_backend_call() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS);
    let cancel = CancellationToken::new();
    let (path, _) = source(dir.path(), 401);

    let err = UploadStrategy::new(&backend, &cancel, 16)
        .upload(&container(), "big.dat", &path, 401, &metadata())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaskError::ObjectTooLarge {
            size: 401,
            capacity: 400
        }
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn small_object_goes_up_in_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS);
    let cancel = CancellationToken::new();
    let (path, bytes) = source(dir.path(), 99);

    let plan = UploadStrategy::new(&backend, &cancel, 16)
        .upload(&container(), "small.dat", &path, 99, &metadata())
        .await
        .unwrap();

    assert_eq!(plan, UploadPlan::SingleShot);
    assert_eq!(
        backend.calls(),
        vec![Call::SingleShot {
            container: "uploads".to_string(),
            name: "small.dat".to_string(),
            size: 99,
        }]
    );
    let objects = backend.objects();
    let stored = &objects[&("uploads".to_string(), "small.dat".to_string())];
    assert_eq!(stored.bytes, bytes);
    assert_eq!(stored.metadata, metadata());
}

#[tokio::test]
async fn large_object_is_staged_then_committed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS);
    let cancel = CancellationToken::new();
    let (path, bytes) = source(dir.path(), 250);

    let plan = UploadStrategy::new(&backend, &cancel, 16)
        .upload(&container(), "large.dat", &path, 250, &metadata())
        .await
        .unwrap();

    // ceil(250 / 10) = 25 beats the 16 byte chunk size.
    let UploadPlan::MultiPart { part_size, parts } = &plan else {
        panic!("expected a multi-part plan, got {plan:?}");
    };
    assert_eq!(*part_size, 25);
    assert_eq!(parts.len(), 10);

    let calls = backend.calls();
    let (Call::Commit { parts: committed, .. }, staged) = calls.split_last().unwrap() else {
        panic!("last call should be the commit: {calls:?}");
    };
    let staged_ids: Vec<_> = staged
        .iter()
        .map(|call| match call {
            Call::UploadPart { part_id, size, .. } => {
                assert_eq!(*size, 25);
                part_id.clone()
            }
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    assert_eq!(&staged_ids, committed);

    let objects = backend.objects();
    let stored = &objects[&("uploads".to_string(), "large.dat".to_string())];
    assert_eq!(stored.bytes, bytes);
    assert!(!dir.path().join("object.dat.part").exists());
}

#[tokio::test]
async fn last_part_may_be_short() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS);
    let cancel = CancellationToken::new();
    let (path, bytes) = source(dir.path(), 130);

    let plan = UploadStrategy::new(&backend, &cancel, 32)
        .upload(&container(), "odd.dat", &path, 130, &metadata())
        .await
        .unwrap();

    assert_eq!(plan.part_count(), 5);
    let sizes: Vec<usize> = backend
        .calls()
        .iter()
        .filter_map(|call| match call {
            Call::UploadPart { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![32, 32, 32, 32, 2]);
    assert_eq!(
        backend.objects()[&("uploads".to_string(), "odd.dat".to_string())].bytes,
        bytes
    );
}

#[tokio::test]
async fn failed_part_aborts_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS).failing_part(2);
    let cancel = CancellationToken::new();
    let (path, _) = source(dir.path(), 200);

    let err = UploadStrategy::new(&backend, &cancel, 16)
        .upload(&container(), "broken.dat", &path, 200, &metadata())
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Backend(_)));
    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    assert!(!calls.iter().any(|c| matches!(c, Call::Commit { .. })));
    assert!(backend.objects().is_empty());
    assert!(!dir.path().join("object.dat.part").exists());
}

#[tokio::test]
async fn cancelled_upload_never_reaches_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(SMALL_LIMITS);
    let cancel = CancellationToken::new();
    cancel.cancel();

    for len in [50, 200] {
        let (path, _) = source(dir.path(), len);
        let err = UploadStrategy::new(&backend, &cancel, 16)
            .upload(&container(), "x.dat", &path, len as u64, &metadata())
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "len {len}: {err}");
    }
    assert!(backend.calls().is_empty());
}
