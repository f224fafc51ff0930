//! The batch run: resolve containers, then generate and upload every file
//! through a bounded scheduler while tracking progress.

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{RunError, TaskError, until_cancelled};
use crate::models::container::{Container, ContainerSpec};
use crate::models::metadata::ObjectMetadata;
use crate::models::run::{RunParameters, RunState, RunSummary};
use crate::models::task::FileTask;
use crate::services::artifact::LocalArtifact;
use crate::services::containers::resolve_targets;
use crate::services::content::{Chunks, write_object};
use crate::services::digest::digest_file;
use crate::services::progress::{ProgressTracker, format_elapsed, format_throughput};
use crate::services::scheduler::{DispatchReport, Scheduler};
use crate::services::storage_service::StorageBackend;
use crate::services::upload::UploadStrategy;

/// Drives a single batch run against one storage backend.
pub struct DataMaker {
    backend: Arc<dyn StorageBackend>,
    state: Mutex<RunState>,
}

impl DataMaker {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn state(&self) -> RunState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, next: RunState) -> Result<(), RunError> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.can_transition_to(next) {
            return Err(RunError::AlreadyStarted(*state));
        }
        debug!("run state {:?} -> {:?}", *state, next);
        *state = next;
        Ok(())
    }

    /// Execute the run to completion or cancellation.
    ///
    /// Per-file failures are counted in the summary. Only faults that stop
    /// the whole batch are returned as errors.
    pub async fn run(
        &self,
        params: &RunParameters,
        spec: &ContainerSpec,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        self.transition(RunState::Running)?;
        let tracker = Arc::new(ProgressTracker::new(
            params.file_count as u64,
            params.report_interval,
        ));

        let containers: Arc<[Container]> =
            match resolve_targets(self.backend.as_ref(), spec, &cancel).await {
                Ok(containers) => containers.into(),
                Err(RunError::Cancelled) => {
                    warn!("Cancelled while preparing containers");
                    self.transition(RunState::Cancelled)?;
                    return Ok(self.finish(params, &tracker, DispatchReport::default()));
                }
                Err(err) => return Err(self.fault(err)),
            };

        if let Err(source) = fs::create_dir_all(&params.work_dir).await {
            return Err(self.fault(RunError::WorkDir {
                path: params.work_dir.clone(),
                source,
            }));
        }

        info!(
            "Processing Starting: {} files of {}-{} bytes into {} containers with {} threads",
            params.file_count,
            params.min_file_bytes,
            params.max_file_bytes,
            containers.len(),
            params.concurrency
        );

        let pipeline = FilePipeline {
            backend: self.backend.clone(),
            tracker: tracker.clone(),
            params: Arc::new(params.clone()),
            cancel: cancel.clone(),
        };
        let scheduler = Scheduler::new(params.concurrency, cancel.clone());
        let mut rng = StdRng::from_entropy();

        let report = scheduler
            .dispatch(params.file_count, |seq| {
                let task = FileTask::new(
                    seq,
                    params.file_count,
                    &containers,
                    params.min_file_bytes,
                    params.max_file_bytes,
                    &mut rng,
                );
                pipeline.clone().run(task)
            })
            .await;

        let final_state = if cancel.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        self.transition(final_state)?;
        Ok(self.finish(params, &tracker, report))
    }

    /// Build the summary of a run that reached a terminal state and log the
    /// closing line.
    fn finish(
        &self,
        params: &RunParameters,
        tracker: &ProgressTracker,
        report: DispatchReport,
    ) -> RunSummary {
        let summary = self.summarize(params, tracker, report);
        if summary.failed_files > 0 {
            warn!("{} files failed", summary.failed_files);
        }
        info!(
            "Processing Finished {} files after {} ({})",
            summary.completed_files,
            format_elapsed(summary.elapsed),
            format_throughput(summary.throughput_bps)
        );
        summary
    }

    fn fault(&self, err: RunError) -> RunError {
        error!("run failed: {}", err);
        if let Err(transition) = self.transition(RunState::Faulted) {
            warn!("{}", transition);
        }
        err
    }

    fn summarize(
        &self,
        params: &RunParameters,
        tracker: &ProgressTracker,
        report: DispatchReport,
    ) -> RunSummary {
        let elapsed = tracker.elapsed();
        let completed_bytes = tracker.completed_bytes();
        RunSummary {
            state: self.state(),
            total_files: params.file_count,
            dispatched_files: report.dispatched,
            completed_files: tracker.completed_files(),
            completed_bytes,
            failed_files: report.failed + report.panicked,
            cancelled_files: report.cancelled,
            elapsed,
            throughput_bps: throughput(completed_bytes, elapsed),
        }
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}

/// Everything one file needs, cloned into each spawned task.
#[derive(Clone)]
struct FilePipeline {
    backend: Arc<dyn StorageBackend>,
    tracker: Arc<ProgressTracker>,
    params: Arc<RunParameters>,
    cancel: CancellationToken,
}

impl FilePipeline {
    async fn run(self, task: FileTask) -> Result<(), TaskError> {
        debug!(
            seq = task.seq,
            container = %task.container.name,
            "creating {} ({} bytes)",
            task.name,
            task.size
        );

        let result = self.process(&task).await;
        match &result {
            Ok(()) => debug!(seq = task.seq, "uploaded {}", task.name),
            Err(err) if err.is_cancelled() => debug!(seq = task.seq, "cancelled {}", task.name),
            Err(err) => error!(
                seq = task.seq,
                container = %task.container.name,
                "file {} failed: {}",
                task.name,
                err
            ),
        }
        result
    }

    async fn process(&self, task: &FileTask) -> Result<(), TaskError> {
        let params = &self.params;
        let artifact = LocalArtifact::new(task.local_path(&params.work_dir));

        let chunks = Chunks::new(task.size, params.chunk_size, params.content_mode);
        let written = write_object(artifact.path(), chunks, &self.cancel).await?;
        let digest = until_cancelled(&self.cancel, digest_file(artifact.path())).await?;
        let metadata = ObjectMetadata::for_file(&digest, params.content_mode, task.seq, written);

        let plan = UploadStrategy::new(self.backend.as_ref(), &self.cancel, params.chunk_size)
            .upload(
                &task.container,
                &task.name,
                artifact.path(),
                written,
                &metadata,
            )
            .await?;
        debug!(seq = task.seq, parts = plan.part_count(), "committed {}", task.name);

        self.tracker.record(written);

        if let Err(err) = artifact.remove().await {
            warn!("could not delete {}: {}", task.name, err);
        }
        Ok(())
    }
}
