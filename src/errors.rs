//! Error types for per-file work and for the run as a whole.
//!
//! A `TaskError` only ever fails its own file; a `RunError` fails the batch.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::run::RunState;
use crate::services::storage_service::StorageError;

/// Why a single file pipeline did not complete.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("object of {size} bytes exceeds backend capacity of {capacity} bytes")]
    ObjectTooLarge { size: u64, capacity: u64 },
    #[error("local i/o failed: {0}")]
    LocalIo(#[from] io::Error),
    #[error("storage backend failed: {0}")]
    Backend(#[from] StorageError),
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Faults that stop the whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no target containers could be resolved")]
    NoContainers,
    #[error("failed to prepare container `{name}`: {source}")]
    Container {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("cannot create work directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cancelled before any file was dispatched")]
    Cancelled,
    #[error("run already started (state {0:?})")]
    AlreadyStarted(RunState),
}

/// Race `fut` against `cancel`. Cancellation wins ties so that no new
/// backend work starts once the signal is raised.
pub async fn until_cancelled<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TaskError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}
