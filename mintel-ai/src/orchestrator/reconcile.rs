//! Reconciliation of in-flight work items against their stage tasks
//!
//! Stage events travel over an in-process channel and are lost if the
//! process dies between a task write and the orchestrator handling it. The
//! reconciler re-derives the missing transition from the durable task state,
//! at startup and on the maintenance cadence. Every repair goes through the
//! same idempotent operations the event loop uses.

use super::PipelineOrchestrator;
use crate::db::work_items;
use crate::models::{Stage, StageOutput, Task, TaskState, WorkItemStatus};
use mintel_common::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one reconciliation pass repaired
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Scheduled items whose entry task was submitted
    pub started: usize,
    /// Entry tasks re-submitted for the current run
    pub resubmitted: usize,
    /// Items fanned out after a missed entry completion
    pub fanned_out: usize,
    /// Fan-out completions counted after a missed event
    pub fanned_in: usize,
    /// Fan-out tasks re-submitted after a failed or lost submission
    pub requeued: usize,
    /// Items failed after a missed exhaustion
    pub failed: usize,
}

impl ReconcileReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The task for `stage` on the current run, if any
fn current_task(task: Option<Task>, run: i64) -> Option<Task> {
    task.filter(|task| task.run == run)
}

impl PipelineOrchestrator {
    /// Repair work items whose stage events were lost
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let items = work_items::list_by_status(
            &self.db,
            &[
                WorkItemStatus::Scheduled,
                WorkItemStatus::Pending,
                WorkItemStatus::Processing,
                WorkItemStatus::Transcribed,
            ],
        )
        .await?;

        let mut report = ReconcileReport::default();
        for (id, status, run) in items {
            let repaired = match status {
                WorkItemStatus::Scheduled => self.reconcile_scheduled(id, &mut report).await,
                WorkItemStatus::Pending | WorkItemStatus::Processing => {
                    self.reconcile_entry(id, run, &mut report).await
                }
                WorkItemStatus::Transcribed => self.reconcile_fan_out(id, run, &mut report).await,
                _ => Ok(()),
            };

            // One broken item must not stall the rest of the pass
            if let Err(e) = repaired {
                warn!(work_item_id = %id, status = %status, error = %e, "Could not reconcile work item");
            }
        }

        if !report.is_empty() {
            info!(
                started = report.started,
                resubmitted = report.resubmitted,
                fanned_out = report.fanned_out,
                fanned_in = report.fanned_in,
                requeued = report.requeued,
                failed = report.failed,
                "Reconciliation repaired work items"
            );
        }

        Ok(report)
    }

    async fn reconcile_scheduled(&self, id: Uuid, report: &mut ReconcileReport) -> Result<()> {
        self.start_pipeline(id).await?;
        report.started += 1;
        Ok(())
    }

    async fn reconcile_entry(&self, id: Uuid, run: i64, report: &mut ReconcileReport) -> Result<()> {
        let entry = self.topology.entry();
        let task = self.queues.get(entry)?.get_status(&entry.task_id(id)).await?;

        match current_task(task, run) {
            None => {
                let outcome = self.start_pipeline(id).await?;
                if outcome.created {
                    report.resubmitted += 1;
                }
            }
            Some(task) if task.state == TaskState::Completed => {
                self.on_stage_complete(entry, id, run).await?;
                report.fanned_out += 1;
            }
            Some(task) if task.state == TaskState::Failed => {
                let reason = task.failure_reason.unwrap_or_else(|| "unknown failure".to_string());
                self.on_stage_failed(entry, id, run, &reason).await?;
                report.failed += 1;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn reconcile_fan_out(&self, id: Uuid, run: i64, report: &mut ReconcileReport) -> Result<()> {
        if self.topology.required_fan_out_count() == 0 {
            if work_items::transition_status(&self.db, id, Some(run), WorkItemStatus::Completed, None).await? {
                report.fanned_in += 1;
            }
            return Ok(());
        }

        for stage in self.topology.fan_out().iter().copied() {
            if work_items::is_stage_marked(&self.db, id, run, stage).await? {
                continue;
            }

            let task = self.queues.get(stage)?.get_status(&stage.task_id(id)).await?;
            match current_task(task, run) {
                None => {
                    if self.requeue_fan_out_stage(id, run, stage).await? {
                        report.requeued += 1;
                    }
                }
                Some(task) if task.state == TaskState::Completed => {
                    self.on_stage_complete(stage, id, run).await?;
                    report.fanned_in += 1;
                }
                Some(task) if task.state == TaskState::Failed && self.topology.is_required(stage) => {
                    let reason = task.failure_reason.unwrap_or_else(|| "unknown failure".to_string());
                    self.on_stage_failed(stage, id, run, &reason).await?;
                    report.failed += 1;
                    return Ok(());
                }
                Some(task) if task.state == TaskState::Failed => {
                    let reason = task.failure_reason.unwrap_or_else(|| "unknown failure".to_string());
                    self.on_stage_failed(stage, id, run, &reason).await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn requeue_fan_out_stage(&self, id: Uuid, run: i64, stage: Stage) -> Result<bool> {
        let item = self.load_item(id).await?;
        if item.run != run || item.status != WorkItemStatus::Transcribed {
            return Ok(false);
        }

        let Some(StageOutput::Transcription(transcript)) =
            work_items::load_stage_output(&self.db, id, self.topology.entry()).await?
        else {
            debug!(work_item_id = %id, stage = %stage, "No transcript to re-submit from");
            return Ok(false);
        };

        let outcome = self.enqueue_fan_out_stage(stage, &item, &transcript).await?;
        if outcome.created {
            warn!(work_item_id = %id, stage = %stage, run, "Missing fan-out task re-submitted");
        }
        Ok(outcome.created)
    }
}
