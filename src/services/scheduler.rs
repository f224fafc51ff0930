//! Bounded-concurrency dispatch of file pipelines.
//!
//! A task is only spawned once it holds a semaphore permit, and the permit
//! travels with the task so the slot frees the moment it finishes, whether
//! it succeeds, fails or panics.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::TaskError;

/// Tally of how dispatched tasks ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

impl DispatchReport {
    fn absorb(&mut self, joined: Result<Result<(), TaskError>, JoinError>) {
        match joined {
            Ok(Ok(())) => self.succeeded += 1,
            Ok(Err(err)) if err.is_cancelled() => self.cancelled += 1,
            Ok(Err(_)) => self.failed += 1,
            Err(err) if err.is_cancelled() => self.cancelled += 1,
            Err(err) => {
                error!("file task panicked: {}", err);
                self.panicked += 1;
            }
        }
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.cancelled + self.panicked
    }
}

pub struct Scheduler {
    permits: Arc<Semaphore>,
    limit: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    /// `limit` is clamped to `1..=Semaphore::MAX_PERMITS`.
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        let limit = limit.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            cancel,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `make_task(i)` for `i` in `0..count` with at most `limit` tasks
    /// in flight. Stops handing out new work once cancelled, then waits for
    /// every spawned task before returning.
    pub async fn dispatch<F, Fut>(&self, count: usize, mut make_task: F) -> DispatchReport
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut report = DispatchReport::default();

        for seq in 0..count {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fut = make_task(seq);
            tasks.spawn(async move {
                let _permit = permit;
                fut.await
            });
            report.dispatched += 1;

            while let Some(joined) = tasks.try_join_next() {
                report.absorb(joined);
            }
        }

        if report.dispatched < count {
            debug!(
                "dispatch stopped after {} of {} tasks",
                report.dispatched, count
            );
        }

        while let Some(joined) = tasks.join_next().await {
            report.absorb(joined);
        }
        report
    }
}
