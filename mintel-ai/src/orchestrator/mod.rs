//! Pipeline orchestrator
//!
//! Drives one work item through its pipeline run:
//!
//! ```text
//! NotStarted --start--> entry queued --entry completed--> fan-out queued
//! fan-out queued --all required completed--> Completed
//! fan-out queued --required stage exhausted--> Failed
//! any --cancel--> Cancelled
//! ```
//!
//! Stage queues report progress as [`StageEvent`]s on a channel consumed by
//! [`PipelineOrchestrator::run`]. Every transition is a compare-and-set on
//! the work-item row, so the event loop, HTTP handlers and the reconciler can
//! act on the same item concurrently. Events tagged with an older `run` are
//! ignored.

pub mod reconcile;
pub mod status;

pub use reconcile::ReconcileReport;
pub use status::{project_status, PipelineStatus, StageSnapshot, StageState};

use crate::db::work_items::{self, FanIn};
use crate::models::{
    NewWorkItem, PipelineTopology, Stage, StageOutput, TaskPayload, Transcript, WorkItem,
    WorkItemStatus,
};
use crate::queue::{CancelOutcome, EnqueueOutcome, StageEvent, StageEventKind, StageQueues};
use futures::future::join_all;
use mintel_common::{Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of [`PipelineOrchestrator::cancel_pipeline`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineCancellation {
    pub work_item_id: Uuid,
    pub status: WorkItemStatus,
    /// Per-stage cleanup outcome; absent where the queue could not be reached
    pub tasks: BTreeMap<Stage, CancelOutcome>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    db: SqlitePool,
    queues: StageQueues,
    topology: Arc<PipelineTopology>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl PipelineOrchestrator {
    pub fn new(db: SqlitePool, queues: StageQueues, topology: PipelineTopology) -> Self {
        Self {
            db,
            queues,
            topology: Arc::new(topology),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn topology(&self) -> &PipelineTopology {
        &self.topology
    }

    pub fn queues(&self) -> &StageQueues {
        &self.queues
    }

    /// Most recent orchestration error, for the health endpoint
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    async fn record_error(&self, message: String) {
        *self.last_error.write().await = Some(message);
    }

    /// Create a work item and start its pipeline.
    ///
    /// A failed start is logged, not returned: the item stays Scheduled and
    /// the reconciler or a re-submission picks it up later.
    pub async fn submit(&self, submission: NewWorkItem) -> Result<WorkItem> {
        submission.validate()?;

        let item = WorkItem::new(submission);
        work_items::insert_work_item(&self.db, &item).await?;
        info!(
            work_item_id = %item.id,
            requester_id = %item.requester_id,
            size_bytes = item.size_bytes,
            "Work item created"
        );

        if let Err(e) = self.start_pipeline(item.id).await {
            error!(work_item_id = %item.id, error = %e, "Failed to start pipeline, item left scheduled");
            self.record_error(format!("start pipeline {}: {}", item.id, e)).await;
        }

        self.load_item(item.id).await
    }

    /// Enqueue the entry-stage task for the item's current run.
    ///
    /// Idempotent. Fails without touching the work item if the entry queue
    /// rejects the submission.
    pub async fn start_pipeline(&self, work_item_id: Uuid) -> Result<EnqueueOutcome> {
        let item = self.load_item(work_item_id).await?;
        if item.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Work item {} is {}, re-submit it to run again",
                work_item_id, item.status
            )));
        }

        let entry = self.topology.entry();
        let payload = TaskPayload::Transcription {
            work_item_id,
            source_locator: item.source_locator.clone(),
            size_bytes: item.size_bytes,
            requester_id: item.requester_id.clone(),
        };

        let outcome = self.queues.get(entry)?.enqueue(work_item_id, item.run, payload).await?;

        if work_items::transition_status(&self.db, work_item_id, Some(item.run), WorkItemStatus::Pending, None)
            .await?
        {
            info!(work_item_id = %work_item_id, run = item.run, "Pipeline started");
        }

        Ok(outcome)
    }

    /// Consume stage events until `shutdown` fires, reconciling every `reconcile_interval`
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<StageEvent>,
        reconcile_interval: Duration,
        shutdown: CancellationToken,
    ) {
        // First pass one interval in; the caller reconciles once before starting the loop
        let mut ticker = tokio::time::interval_at(Instant::now() + reconcile_interval, reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Pipeline orchestrator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle_event(&event).await {
                        error!(
                            work_item_id = %event.work_item_id,
                            stage = %event.stage,
                            error = %e,
                            "Failed to handle stage event"
                        );
                        self.record_error(format!("{} event for {}: {}", event.stage, event.work_item_id, e))
                            .await;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Reconciliation pass failed");
                        self.record_error(format!("reconcile: {}", e)).await;
                    }
                }
            }
        }

        info!("Pipeline orchestrator stopped");
    }

    /// Apply one stage event
    pub async fn handle_event(&self, event: &StageEvent) -> Result<()> {
        let Some((status, run)) = work_items::load_status(&self.db, event.work_item_id).await? else {
            debug!(work_item_id = %event.work_item_id, "Event for unknown work item ignored");
            return Ok(());
        };

        if run != event.run {
            debug!(
                work_item_id = %event.work_item_id,
                stage = %event.stage,
                event_run = event.run,
                run,
                "Event from an earlier run ignored"
            );
            return Ok(());
        }

        match &event.kind {
            StageEventKind::Started { attempt } => {
                if event.stage == self.topology.entry() && !status.is_terminal() {
                    self.mark_processing(event.work_item_id, run, *attempt).await?;
                }
                Ok(())
            }
            StageEventKind::Completed => self.on_stage_complete(event.stage, event.work_item_id, run).await,
            StageEventKind::Exhausted { reason } => {
                self.on_stage_failed(event.stage, event.work_item_id, run, reason).await
            }
        }
    }

    async fn mark_processing(&self, id: Uuid, run: i64, attempt: u32) -> Result<()> {
        // The worker can claim before start_pipeline has moved the item off Scheduled
        work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Pending, None).await?;
        if work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Processing, None).await? {
            debug!(work_item_id = %id, attempt, "Work item processing");
        }
        Ok(())
    }

    /// A stage task of `run` completed
    pub async fn on_stage_complete(&self, stage: Stage, id: Uuid, run: i64) -> Result<()> {
        if stage == self.topology.entry() {
            self.fan_out(id, run).await
        } else {
            self.fan_in(stage, id, run).await
        }
    }

    /// Entry stage done: move to Transcribed and enqueue every fan-out stage, in order
    async fn fan_out(&self, id: Uuid, run: i64) -> Result<()> {
        let item = self.load_item(id).await?;
        if item.run != run {
            return Ok(());
        }

        let Some(StageOutput::Transcription(transcript)) =
            work_items::load_stage_output(&self.db, id, self.topology.entry()).await?
        else {
            let reason = "transcription completed without a stored transcript";
            error!(work_item_id = %id, run, "{}", reason);
            if work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Failed, Some(reason)).await? {
                self.cancel_outstanding(id).await;
            }
            return Ok(());
        };

        work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Pending, None).await?;

        let required = i64::try_from(self.topology.required_fan_out_count()).unwrap_or(i64::MAX);
        if !work_items::begin_fan_out(&self.db, id, run, required).await? {
            // Already fanned out (duplicate event or reconciler) or no longer applicable
            let current = work_items::load_status(&self.db, id).await?;
            if current != Some((WorkItemStatus::Transcribed, run)) {
                debug!(work_item_id = %id, run, "Fan-out skipped, item moved on");
                return Ok(());
            }
        } else {
            info!(
                work_item_id = %id,
                run,
                stages = ?self.topology.fan_out(),
                required,
                "Transcription completed, fanning out"
            );
        }

        let mut first_error = None;
        for stage in self.topology.fan_out() {
            match self.enqueue_fan_out_stage(*stage, &item, &transcript).await {
                Ok(_) => {}
                Err(Error::Conflict(reason)) => {
                    // Re-submitted while fanning out; the new run does its own fan-out
                    debug!(work_item_id = %id, run, reason = %reason, "Fan-out stopped, run superseded");
                    return Ok(());
                }
                Err(e) => {
                    error!(work_item_id = %id, stage = %stage, error = %e, "Fan-out submission failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        // A cancel that landed while we were enqueueing must not leave live tasks behind
        if let Some((WorkItemStatus::Cancelled, _)) = work_items::load_status(&self.db, id).await? {
            self.cancel_outstanding(id).await;
            return Ok(());
        }

        if required == 0
            && work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Completed, None).await?
        {
            info!(work_item_id = %id, run, "Pipeline completed, no required fan-out stages");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) async fn enqueue_fan_out_stage(
        &self,
        stage: Stage,
        item: &WorkItem,
        transcript: &Transcript,
    ) -> Result<EnqueueOutcome> {
        let payload = TaskPayload::Analysis {
            work_item_id: item.id,
            transcript_text: transcript.text.clone(),
            participants: item.participants.clone(),
            language_code: Some(transcript.language_code.clone()),
        };
        self.queues.get(stage)?.enqueue(item.id, item.run, payload).await
    }

    async fn fan_in(&self, stage: Stage, id: Uuid, run: i64) -> Result<()> {
        let counted = self.topology.is_required(stage);

        match work_items::record_fan_in(&self.db, id, run, stage, counted).await? {
            FanIn::Completed => info!(work_item_id = %id, run, "Pipeline completed"),
            FanIn::Remaining(remaining) => {
                debug!(work_item_id = %id, stage = %stage, remaining, "Required stage completed")
            }
            FanIn::Recorded => debug!(work_item_id = %id, stage = %stage, "Optional stage completed"),
            FanIn::Duplicate => debug!(work_item_id = %id, stage = %stage, "Duplicate completion ignored"),
            FanIn::NotApplicable => {
                debug!(work_item_id = %id, stage = %stage, "Completion after item left transcribed")
            }
        }
        Ok(())
    }

    /// A stage task of `run` failed terminally
    pub async fn on_stage_failed(&self, stage: Stage, id: Uuid, run: i64, reason: &str) -> Result<()> {
        if !self.topology.is_required(stage) {
            // Settled for this run: the reconciler must not re-submit it once the task is pruned
            work_items::record_fan_in(&self.db, id, run, stage, false).await?;
            warn!(work_item_id = %id, stage = %stage, reason, "Optional stage failed, pipeline continues");
            return Ok(());
        }

        if stage == self.topology.entry() {
            work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Pending, None).await?;
        }

        let message = format!("{} failed: {}", stage, reason);
        if work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Failed, Some(&message)).await? {
            error!(work_item_id = %id, stage = %stage, run, reason, "Required stage failed, pipeline failed");
            self.cancel_outstanding(id).await;
        } else {
            debug!(work_item_id = %id, stage = %stage, "Stage failure after item left the run");
        }
        Ok(())
    }

    /// Best-effort removal of every stage task of a work item
    async fn cancel_outstanding(&self, id: Uuid) -> BTreeMap<Stage, CancelOutcome> {
        let attempts = self.queues.iter().map(|(stage, queue)| async move {
            let outcome = queue.cancel(&stage.task_id(id)).await;
            (stage, outcome)
        });

        let mut outcomes = BTreeMap::new();
        for (stage, outcome) in join_all(attempts).await {
            match outcome {
                Ok(outcome) => {
                    outcomes.insert(stage, outcome);
                }
                Err(e) => warn!(work_item_id = %id, stage = %stage, error = %e, "Task cleanup failed"),
            }
        }
        outcomes
    }

    /// Cancel a pipeline run.
    ///
    /// The item is always set to Cancelled; task removal is advisory cleanup.
    /// Active tasks are only flagged and stop at their next safe point.
    pub async fn cancel_pipeline(&self, work_item_id: Uuid) -> Result<PipelineCancellation> {
        if work_items::load_status(&self.db, work_item_id).await?.is_none() {
            return Err(Error::NotFound(format!("Work item {}", work_item_id)));
        }

        if work_items::transition_status(&self.db, work_item_id, None, WorkItemStatus::Cancelled, None).await? {
            info!(work_item_id = %work_item_id, "Pipeline cancelled");
        } else {
            debug!(work_item_id = %work_item_id, "Pipeline already cancelled");
        }

        let tasks = self.cancel_outstanding(work_item_id).await;

        Ok(PipelineCancellation {
            work_item_id,
            status: WorkItemStatus::Cancelled,
            tasks,
        })
    }

    /// Re-submit a finished (or never started) work item as a new run
    pub async fn retry_pipeline(&self, work_item_id: Uuid) -> Result<WorkItem> {
        let Some((status, _)) = work_items::load_status(&self.db, work_item_id).await? else {
            return Err(Error::NotFound(format!("Work item {}", work_item_id)));
        };
        if !status.can_resubmit() {
            return Err(Error::Conflict(format!(
                "Work item {} is {}, wait for it to finish or cancel it first",
                work_item_id, status
            )));
        }

        self.cancel_outstanding(work_item_id).await;

        let resubmittable: Vec<WorkItemStatus> = WorkItemStatus::ALL
            .into_iter()
            .filter(|s| s.can_resubmit())
            .collect();
        let Some(run) = work_items::reset_for_resubmission(&self.db, work_item_id, &resubmittable).await? else {
            return Err(Error::Conflict(format!(
                "Work item {} changed state during re-submission",
                work_item_id
            )));
        };

        info!(work_item_id = %work_item_id, previous = %status, run, "Work item re-submitted");

        if let Err(e) = self.start_pipeline(work_item_id).await {
            error!(work_item_id = %work_item_id, error = %e, "Failed to restart pipeline, item left scheduled");
            self.record_error(format!("restart pipeline {}: {}", work_item_id, e)).await;
        }

        self.load_item(work_item_id).await
    }

    /// Merged per-stage view of the item's current run.
    ///
    /// Stages without a task for this run report a NotStarted placeholder,
    /// including when their queue could not be read.
    pub async fn get_pipeline_status(&self, work_item_id: Uuid) -> Result<PipelineStatus> {
        let item = self.load_item(work_item_id).await?;

        let mut stages = BTreeMap::new();
        for stage in self.topology.active_stages() {
            let required = self.topology.is_required(stage);
            let policy = self.topology.policy(stage);
            let placeholder = StageSnapshot::not_started(required, policy.max_attempts);

            let snapshot = match self.queues.get(stage) {
                Ok(queue) => match queue.get_status(&stage.task_id(work_item_id)).await {
                    Ok(Some(task)) if task.run == item.run => StageSnapshot::from_task(&task, required),
                    Ok(_) => placeholder,
                    Err(e) => {
                        warn!(work_item_id = %work_item_id, stage = %stage, error = %e, "Stage status unavailable");
                        placeholder
                    }
                },
                Err(_) => placeholder,
            };
            stages.insert(stage, snapshot);
        }

        let states: BTreeMap<Stage, StageState> =
            stages.iter().map(|(stage, snapshot)| (*stage, snapshot.state)).collect();
        let projected_status = project_status(item.status, &self.topology, &states);

        Ok(PipelineStatus {
            work_item_id,
            run: item.run,
            status: item.status,
            projected_status,
            processing_meta: item.processing_meta,
            stages,
        })
    }

    pub async fn get_work_item(&self, work_item_id: Uuid) -> Result<WorkItem> {
        self.load_item(work_item_id).await
    }

    async fn load_item(&self, id: Uuid) -> Result<WorkItem> {
        work_items::load_work_item(&self.db, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Work item {}", id)))
    }
}
