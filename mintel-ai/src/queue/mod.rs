//! Durable stage queue
//!
//! One [`StageQueue`] per pipeline stage, backed by the `stage_tasks` table.
//! Delivery is at-least-once: a claimed task holds a lease, and only the
//! holder of the current lease can complete, fail or heartbeat it. The stall
//! detector (see [`maintenance`]) revokes leases of workers that stopped
//! heartbeating.
//!
//! Queues are built once at startup and shared through [`StageQueues`].

pub mod backoff;
pub mod event;
pub mod maintenance;

pub use event::{StageEvent, StageEventKind};

use crate::db::{tasks, work_items};
use crate::models::{PipelineTopology, QueueStats, Stage, StagePolicy, Task, TaskPayload, NewTask};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use mintel_common::{time, Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A task handed to a worker by [`StageQueue::claim`]
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    /// Claim token; writes with any other lease are refused
    pub lease: String,
    /// Fired when the task is cancelled while this worker holds it
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub task: Task,
    /// False when an outstanding task with the same id already existed
    pub created: bool,
}

/// Result of completing a claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Cancellation was requested; the task was settled as cancelled instead
    Cancelled,
    /// The lease was revoked (stall detector); nothing written
    LeaseLost,
}

/// Result of failing a claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Delayed; becomes Waiting again after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Terminal failure, reported to the orchestrator
    Exhausted,
    Cancelled,
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Waiting/Delayed task deleted
    Removed,
    /// Active task flagged for cooperative cancellation
    Flagged,
    AlreadyFinished,
    NotFound,
}

pub struct StageQueue {
    db: SqlitePool,
    stage: Stage,
    policy: StagePolicy,
    poll_interval: Duration,
    notify: Notify,
    /// Claimed tasks in this process: task id -> (lease, token)
    cancellation_tokens: RwLock<HashMap<String, (String, CancellationToken)>>,
    events: mpsc::Sender<StageEvent>,
}

impl StageQueue {
    pub fn new(
        db: SqlitePool,
        stage: Stage,
        policy: StagePolicy,
        poll_interval: Duration,
        events: mpsc::Sender<StageEvent>,
    ) -> Self {
        Self {
            db,
            stage,
            policy,
            poll_interval,
            notify: Notify::new(),
            cancellation_tokens: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Submit a task for `work_item_id`.
    ///
    /// Idempotent: while a task with id `stage:workItemId` exists for this run,
    /// the existing task is returned and nothing changes.
    pub async fn enqueue(&self, work_item_id: Uuid, run: i64, payload: TaskPayload) -> Result<EnqueueOutcome> {
        let payload_matches = match (&payload, self.stage) {
            (TaskPayload::Transcription { .. }, Stage::Transcription) => true,
            (TaskPayload::Analysis { .. }, Stage::Transcription) => false,
            (TaskPayload::Transcription { .. }, _) => false,
            (TaskPayload::Analysis { .. }, _) => true,
        };
        if !payload_matches || payload.work_item_id() != work_item_id {
            return Err(Error::InvalidInput(format!(
                "Payload does not belong to {} task for {}",
                self.stage, work_item_id
            )));
        }

        let new_task = NewTask {
            stage: self.stage,
            work_item_id,
            run,
            payload,
            priority: self.policy.priority,
            max_attempts: self.policy.max_attempts.max(1),
        };
        let task_id = new_task.id();

        let created = retry_on_lock("enqueue", DEFAULT_MAX_LOCK_WAIT_MS, || {
            tasks::insert_task(&self.db, &new_task, time::now_millis())
        })
        .await?;

        if !created {
            if let Some((_, current)) = work_items::load_status(&self.db, work_item_id).await? {
                if current > run {
                    return Err(Error::Conflict(format!(
                        "{} task for {} belongs to run {}, item is on run {}",
                        self.stage, work_item_id, run, current
                    )));
                }
            }
        }

        let task = tasks::get_task(&self.db, &task_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Task {} vanished after enqueue", task_id)))?;

        if created {
            info!(
                stage = %self.stage,
                task_id = %task_id,
                work_item_id = %work_item_id,
                run,
                "Task enqueued"
            );
            self.notify.notify_one();
        } else {
            debug!(
                stage = %self.stage,
                task_id = %task_id,
                state = %task.state,
                "Enqueue ignored, task already exists"
            );
        }

        Ok(EnqueueOutcome { task, created })
    }

    /// Claim the next task without waiting
    pub async fn try_claim(&self) -> Result<Option<ClaimedTask>> {
        let promoted = self.promote_delayed().await?;
        if promoted > 0 {
            debug!(stage = %self.stage, promoted, "Promoted delayed tasks");
        }

        let lease = Uuid::new_v4().to_string();
        let limit = self.policy.concurrency.max(1);
        let claimed = retry_on_lock("claim", DEFAULT_MAX_LOCK_WAIT_MS, || {
            tasks::claim_next(&self.db, self.stage, limit, &lease, time::now_millis())
        })
        .await?;

        let Some(task) = claimed else {
            return Ok(None);
        };

        let cancel = CancellationToken::new();
        self.cancellation_tokens
            .write()
            .await
            .insert(task.id.clone(), (lease.clone(), cancel.clone()));

        debug!(
            stage = %self.stage,
            task_id = %task.id,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            "Task claimed"
        );

        self.publish(StageEvent::new(&task, StageEventKind::Started { attempt: task.attempts }))
            .await;

        Ok(Some(ClaimedTask { task, lease, cancel }))
    }

    /// Wait for and claim the next task below the concurrency ceiling.
    ///
    /// Returns `None` once `shutdown` fires.
    pub async fn claim(&self, shutdown: &CancellationToken) -> Result<Option<ClaimedTask>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            if let Some(claimed) = self.try_claim().await? {
                return Ok(Some(claimed));
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Active -> Completed, then publish the completion event
    pub async fn complete(&self, claimed: &ClaimedTask, result: &serde_json::Value) -> Result<CommitOutcome> {
        let task = &claimed.task;

        let landed = retry_on_lock("complete", DEFAULT_MAX_LOCK_WAIT_MS, || {
            tasks::complete(&self.db, &task.id, &claimed.lease, result, time::now_millis())
        })
        .await?;

        if !landed {
            return self.settle_refused(claimed).await;
        }

        self.forget(claimed).await;
        self.notify.notify_one();

        info!(
            stage = %self.stage,
            task_id = %task.id,
            work_item_id = %task.work_item_id,
            attempts = task.attempts,
            "Task completed"
        );

        self.publish(StageEvent::new(task, StageEventKind::Completed)).await;
        Ok(CommitOutcome::Committed)
    }

    /// Record a failed attempt.
    ///
    /// Retriable failures with attempts left go to Delayed with exponential
    /// backoff. Anything else is terminal and reported to the orchestrator.
    pub async fn fail(&self, claimed: &ClaimedTask, reason: &str, retryable: bool) -> Result<FailOutcome> {
        let task = &claimed.task;

        if self.is_cancel_requested(&task.id).await? {
            return Ok(match self.release_cancelled(claimed).await? {
                true => FailOutcome::Cancelled,
                false => FailOutcome::LeaseLost,
            });
        }

        let now = time::now_millis();

        if retryable && task.attempts < task.max_attempts {
            let delay = self.policy.backoff.delay_for(task.attempts);
            let available_at = now.saturating_add(delay.as_millis() as i64);

            let scheduled = retry_on_lock("schedule_retry", DEFAULT_MAX_LOCK_WAIT_MS, || {
                tasks::schedule_retry(&self.db, &task.id, &claimed.lease, reason, available_at)
            })
            .await?;

            if scheduled {
                self.forget(claimed).await;
                warn!(
                    stage = %self.stage,
                    task_id = %task.id,
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Task failed, retry scheduled"
                );
                return Ok(FailOutcome::Retrying {
                    attempt: task.attempts,
                    delay,
                });
            }

            return Ok(match self.settle_refused(claimed).await? {
                CommitOutcome::Cancelled => FailOutcome::Cancelled,
                _ => FailOutcome::LeaseLost,
            });
        }

        let failed = retry_on_lock("fail", DEFAULT_MAX_LOCK_WAIT_MS, || {
            tasks::fail_terminal(&self.db, &task.id, &claimed.lease, reason, now)
        })
        .await?;

        if !failed {
            warn!(stage = %self.stage, task_id = %task.id, "Failure not recorded, lease lost");
            return Ok(FailOutcome::LeaseLost);
        }

        self.forget(claimed).await;
        self.notify.notify_one();

        error!(
            stage = %self.stage,
            task_id = %task.id,
            work_item_id = %task.work_item_id,
            attempts = task.attempts,
            retryable,
            reason,
            "Task failed permanently"
        );

        self.publish(StageEvent::new(
            task,
            StageEventKind::Exhausted {
                reason: reason.to_string(),
            },
        ))
        .await;

        Ok(FailOutcome::Exhausted)
    }

    /// Remove a waiting task, or flag an active one for cooperative cancellation
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        // A task can move Waiting -> Active between the two checks; go around again.
        for _ in 0..3 {
            if tasks::delete_pending(&self.db, task_id).await? {
                info!(stage = %self.stage, task_id, "Waiting task removed");
                return Ok(CancelOutcome::Removed);
            }

            if tasks::request_cancel(&self.db, task_id).await? {
                if let Some((_, token)) = self.cancellation_tokens.read().await.get(task_id) {
                    token.cancel();
                }
                info!(stage = %self.stage, task_id, "Active task flagged for cancellation");
                return Ok(CancelOutcome::Flagged);
            }

            match tasks::get_task(&self.db, task_id).await? {
                None => return Ok(CancelOutcome::NotFound),
                Some(task) if task.state.is_terminal() => return Ok(CancelOutcome::AlreadyFinished),
                Some(_) => continue,
            }
        }

        Err(Error::Conflict(format!("Task {} kept changing state during cancel", task_id)))
    }

    /// Settle a cancelled task the worker has stopped working on
    pub async fn release_cancelled(&self, claimed: &ClaimedTask) -> Result<bool> {
        let released = tasks::finish_cancelled(
            &self.db,
            &claimed.task.id,
            &claimed.lease,
            time::now_millis(),
        )
        .await?;

        self.forget(claimed).await;
        if released {
            self.notify.notify_one();
            info!(stage = %self.stage, task_id = %claimed.task.id, "Cancelled task released");
        }
        Ok(released)
    }

    pub async fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        tasks::is_cancel_requested(&self.db, task_id).await
    }

    /// Extend the lease; false if the lease was revoked
    pub async fn heartbeat(&self, claimed: &ClaimedTask) -> Result<bool> {
        tasks::heartbeat(&self.db, &claimed.task.id, &claimed.lease, time::now_millis()).await
    }

    /// Advisory progress, 0-100, never decreasing
    pub async fn report_progress(&self, claimed: &ClaimedTask, percent: u8) -> Result<()> {
        tasks::update_progress(&self.db, &claimed.task.id, &claimed.lease, percent).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Option<Task>> {
        tasks::get_task(&self.db, task_id).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        tasks::stats(&self.db, self.stage).await
    }

    async fn settle_refused(&self, claimed: &ClaimedTask) -> Result<CommitOutcome> {
        if self.is_cancel_requested(&claimed.task.id).await? && self.release_cancelled(claimed).await? {
            return Ok(CommitOutcome::Cancelled);
        }

        self.forget(claimed).await;
        warn!(
            stage = %self.stage,
            task_id = %claimed.task.id,
            "Write refused, lease no longer held"
        );
        Ok(CommitOutcome::LeaseLost)
    }

    /// Drop the local token, unless a newer claim has replaced it
    async fn forget(&self, claimed: &ClaimedTask) {
        let mut tokens = self.cancellation_tokens.write().await;
        if matches!(tokens.get(&claimed.task.id), Some((lease, _)) if *lease == claimed.lease) {
            tokens.remove(&claimed.task.id);
        }
    }

    async fn publish(&self, event: StageEvent) {
        if self.events.send(event).await.is_err() {
            warn!(stage = %self.stage, "Stage event dropped, no orchestrator listening");
        }
    }
}

/// The set of stage queues, one per active stage
#[derive(Clone)]
pub struct StageQueues {
    queues: Arc<BTreeMap<Stage, Arc<StageQueue>>>,
}

impl StageQueues {
    pub fn new(
        db: SqlitePool,
        topology: &PipelineTopology,
        poll_interval: Duration,
        events: mpsc::Sender<StageEvent>,
    ) -> Self {
        let queues = topology
            .active_stages()
            .map(|stage| {
                let queue = StageQueue::new(
                    db.clone(),
                    stage,
                    topology.policy(stage).clone(),
                    poll_interval,
                    events.clone(),
                );
                (stage, Arc::new(queue))
            })
            .collect();

        Self {
            queues: Arc::new(queues),
        }
    }

    pub fn get(&self, stage: Stage) -> Result<&Arc<StageQueue>> {
        self.queues
            .get(&stage)
            .ok_or_else(|| Error::Config(format!("No queue configured for stage {}", stage)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &Arc<StageQueue>)> {
        self.queues.iter().map(|(stage, queue)| (*stage, queue))
    }

    /// Per-stage counts, for dashboards
    pub async fn stats(&self) -> Result<BTreeMap<Stage, QueueStats>> {
        let mut stats = BTreeMap::new();
        for (stage, queue) in self.iter() {
            stats.insert(stage, queue.get_stats().await?);
        }
        Ok(stats)
    }
}
