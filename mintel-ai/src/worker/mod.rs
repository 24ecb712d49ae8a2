//! Stage worker
//!
//! One generic loop, instantiated per stage with a [`StageHandler`]. The loop
//! claims up to the stage's concurrency limit, runs each task on its own tokio
//! task under a timeout and a heartbeat, and always settles the task with
//! `complete` or `fail`. Handler errors and panics never escape the loop.

pub mod handlers;

use crate::db::work_items;
use crate::models::{Stage, StageOutput, Task};
use crate::queue::{ClaimedTask, CommitOutcome, FailOutcome, StageQueue};
use crate::capabilities::CapabilityError;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use handlers::{AnalysisHandler, TranscriptionHandler};

/// Why one execution attempt failed
#[derive(Debug, Error)]
pub enum StageError {
    #[error("capability call failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error("malformed result: {0}")]
    MalformedResult(String),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] mintel_common::Error),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Capability(e) => e.is_retryable(),
            StageError::MalformedResult(_) => true,
            StageError::UnsupportedInput(_) => false,
            StageError::MissingPrerequisite(_) => false,
            StageError::Timeout(_) => true,
            StageError::Panicked(_) => true,
            StageError::Cancelled => false,
            StageError::Storage(_) => true,
        }
    }
}

/// Successful stage execution
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub output: StageOutput,
    /// Capability cost of this attempt
    pub cost: f64,
}

/// Advisory progress reporting for one claimed task
pub struct ProgressReporter {
    queue: Arc<StageQueue>,
    claimed: ClaimedTask,
    last: AtomicU8,
}

impl ProgressReporter {
    /// Report `percent` (clamped to 0-100). Lower values than already reported are ignored.
    pub async fn report(&self, percent: u8) {
        let percent = percent.min(100);
        if self.last.fetch_max(percent, Ordering::SeqCst) >= percent {
            return;
        }
        if let Err(e) = self.queue.report_progress(&self.claimed, percent).await {
            debug!(task_id = %self.claimed.task.id, error = %e, "Progress update failed");
        }
    }
}

/// What a handler gets for one execution attempt
pub struct TaskContext {
    pub task: Task,
    /// Fired on cooperative cancellation; check it at safe points
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl TaskContext {
    pub fn ensure_not_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Stage-specific business logic.
///
/// Must be safe to re-run with the same payload: handlers compute a result and
/// return it; the worker persists it as a full overwrite.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &TaskContext) -> Result<StageResult, StageError>;
}

#[derive(Clone)]
pub struct StageWorker {
    db: SqlitePool,
    queue: Arc<StageQueue>,
    handler: Arc<dyn StageHandler>,
    heartbeat_interval: Duration,
}

impl StageWorker {
    pub fn new(
        db: SqlitePool,
        queue: Arc<StageQueue>,
        handler: Arc<dyn StageHandler>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            handler,
            heartbeat_interval,
        }
    }

    /// Claim and execute tasks until `shutdown` fires, then wait for in-flight tasks
    pub async fn run(self, shutdown: CancellationToken) {
        let stage = self.queue.stage();
        let concurrency = self.queue.policy().concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));

        info!(stage = %stage, concurrency, "Stage worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = match self.queue.claim(&shutdown).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => break,
                Err(e) => {
                    error!(stage = %stage, error = %e, "Claim failed");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.process(claimed).await;
                drop(permit);
            });
        }

        // Drain: every permit back means every in-flight task has settled
        let _ = slots.acquire_many(concurrency as u32).await;
        info!(stage = %stage, "Stage worker stopped");
    }

    /// Execute one claimed task and settle it. Never panics, never leaves it Active.
    pub async fn process(&self, claimed: ClaimedTask) {
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            claimed.clone(),
            self.heartbeat_interval,
            heartbeat_stop.clone(),
        ));

        let ctx = TaskContext {
            task: claimed.task.clone(),
            cancel: claimed.cancel.clone(),
            progress: ProgressReporter {
                queue: self.queue.clone(),
                claimed: claimed.clone(),
                last: AtomicU8::new(0),
            },
        };

        let timeout = self.queue.policy().timeout;
        let handler = self.handler.clone();
        let execution = tokio::spawn(async move { handler.execute(&ctx).await });
        let abort = execution.abort_handle();

        let outcome = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StageError::Panicked(join_error.to_string())),
            Err(_) => {
                abort.abort();
                Err(StageError::Timeout(timeout))
            }
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        self.settle(&claimed, outcome).await;
    }

    async fn settle(&self, claimed: &ClaimedTask, outcome: Result<StageResult, StageError>) {
        let task = &claimed.task;

        let result = match outcome {
            Ok(result) => result,
            Err(StageError::Cancelled) => {
                self.release(claimed).await;
                return;
            }
            Err(err) => {
                self.record_failure(claimed, &err.to_string(), err.is_retryable()).await;
                return;
            }
        };

        // Last safe point before the result becomes visible
        let cancel_requested = claimed.cancel.is_cancelled()
            || self.queue.is_cancel_requested(&task.id).await.unwrap_or(false);
        if cancel_requested {
            self.release(claimed).await;
            return;
        }

        match work_items::save_stage_output(&self.db, task.work_item_id, task.run, &result.output, result.cost).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.id, run = task.run, "Work item moved to a newer run, output discarded");
            }
            Err(e) => {
                self.record_failure(claimed, &format!("failed to persist output: {}", e), true).await;
                return;
            }
        }

        match self.queue.complete(claimed, &result.output.summary()).await {
            Ok(CommitOutcome::Committed) => {}
            Ok(CommitOutcome::Cancelled) => debug!(task_id = %task.id, "Completion refused, task was cancelled"),
            Ok(CommitOutcome::LeaseLost) => debug!(task_id = %task.id, "Completion refused, lease lost"),
            Err(e) => error!(task_id = %task.id, error = %e, "Failed to record completion"),
        }
    }

    async fn record_failure(&self, claimed: &ClaimedTask, reason: &str, retryable: bool) {
        match self.queue.fail(claimed, reason, retryable).await {
            Ok(FailOutcome::Retrying { .. }) | Ok(FailOutcome::Exhausted) => {}
            Ok(FailOutcome::Cancelled) => debug!(task_id = %claimed.task.id, "Failed task was cancelled"),
            Ok(FailOutcome::LeaseLost) => debug!(task_id = %claimed.task.id, "Failure refused, lease lost"),
            Err(e) => error!(task_id = %claimed.task.id, error = %e, "Failed to record failure"),
        }
    }

    async fn release(&self, claimed: &ClaimedTask) {
        if let Err(e) = self.queue.release_cancelled(claimed).await {
            error!(task_id = %claimed.task.id, error = %e, "Failed to release cancelled task");
        }
    }
}

async fn heartbeat_loop(
    queue: Arc<StageQueue>,
    claimed: ClaimedTask,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match queue.heartbeat(&claimed).await {
            Ok(true) => {}
            Ok(false) => {
                // Lease revoked by the stall detector; the result would be refused anyway
                warn!(task_id = %claimed.task.id, "Heartbeat rejected, abandoning task");
                claimed.cancel.cancel();
                return;
            }
            Err(e) => warn!(task_id = %claimed.task.id, error = %e, "Heartbeat failed"),
        }
    }
}
