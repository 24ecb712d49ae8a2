//! Queue housekeeping: delayed-task promotion, stall detection, retention GC

use super::{StageEvent, StageEventKind, StageQueue};
use crate::db::tasks;
use crate::models::TaskState;
use mintel_common::{time, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one maintenance pass changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub promoted: u64,
    pub requeued: usize,
    pub exhausted: usize,
    pub pruned: u64,
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl StageQueue {
    /// Delayed -> Waiting for tasks whose backoff has elapsed
    pub async fn promote_delayed(&self) -> Result<u64> {
        let promoted = tasks::promote_due(&self.db, self.stage, time::now_millis()).await?;
        if promoted > 0 {
            self.notify.notify_one();
        }
        Ok(promoted)
    }

    /// Demote Active tasks without a recent heartbeat.
    ///
    /// A stalled task with attempts left goes back to Waiting (a retry: the
    /// dead worker's lease is revoked, so its late writes cannot land). One
    /// with no attempts left fails and is reported upward.
    pub async fn recover_stalled(&self) -> Result<tasks::StallSweep> {
        let now = time::now_millis();
        let cutoff = now.saturating_sub(duration_millis(self.policy.stall_timeout));

        let sweep = tasks::sweep_stalled(&self.db, self.stage, cutoff, now).await?;

        for task_id in &sweep.requeued {
            warn!(stage = %self.stage, task_id = %task_id, "Stalled task requeued");
        }
        for task_id in &sweep.cancelled {
            info!(stage = %self.stage, task_id = %task_id, "Stalled cancelled task released");
        }
        for task in &sweep.exhausted {
            warn!(
                stage = %self.stage,
                task_id = %task.id,
                attempts = task.attempts,
                "Stalled task out of attempts"
            );
            self.publish(StageEvent::new(
                task,
                StageEventKind::Exhausted {
                    reason: task
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "stalled".to_string()),
                },
            ))
            .await;
        }

        if !sweep.requeued.is_empty() {
            self.notify.notify_one();
        }

        Ok(sweep)
    }

    /// Delete finished tasks beyond the retention bounds
    pub async fn prune_retention(&self) -> Result<u64> {
        let retention = self.policy.retention;
        let now = time::now_millis();

        let completed = tasks::prune_finished(
            &self.db,
            self.stage,
            TaskState::Completed,
            retention.keep_completed,
            now.saturating_sub(duration_millis(retention.completed_max_age)),
        )
        .await?;

        let failed = tasks::prune_finished(
            &self.db,
            self.stage,
            TaskState::Failed,
            retention.keep_failed,
            now.saturating_sub(duration_millis(retention.failed_max_age)),
        )
        .await?;

        Ok(completed + failed)
    }

    /// One full housekeeping pass
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let promoted = self.promote_delayed().await?;
        let sweep = self.recover_stalled().await?;
        let pruned = self.prune_retention().await?;

        let report = MaintenanceReport {
            promoted,
            requeued: sweep.requeued.len(),
            exhausted: sweep.exhausted.len(),
            pruned,
        };

        if report != MaintenanceReport::default() {
            debug!(
                stage = %self.stage,
                promoted = report.promoted,
                requeued = report.requeued,
                exhausted = report.exhausted,
                pruned = report.pruned,
                "Queue maintenance pass"
            );
        }

        Ok(report)
    }
}

/// Run [`StageQueue::maintain`] every `interval` until `shutdown` fires
pub async fn run_maintenance(queue: Arc<StageQueue>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = queue.maintain().await {
            warn!(stage = %queue.stage(), error = %e, "Queue maintenance failed");
        }
    }

    debug!(stage = %queue.stage(), "Queue maintenance stopped");
}
