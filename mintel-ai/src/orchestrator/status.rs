//! Pipeline status snapshot and the work-item status projection
//!
//! The projection maps the per-stage task states onto the externally visible
//! [`WorkItemStatus`]. It reads the required/optional classification from the
//! same [`PipelineTopology`] the fan-in count uses.

use crate::models::{PipelineTopology, ProcessingMeta, Stage, Task, TaskState, WorkItemStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A stage's state as seen by a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// No task for the current run (not reached yet, or queue unavailable)
    NotStarted,
    Waiting,
    Active,
    /// Failed an attempt, waiting out its backoff
    Delayed,
    Completed,
    /// Retries exhausted or non-retriable failure
    Failed,
}

impl From<TaskState> for StageState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Waiting => StageState::Waiting,
            TaskState::Active => StageState::Active,
            TaskState::Delayed => StageState::Delayed,
            TaskState::Completed => StageState::Completed,
            TaskState::Failed => StageState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub state: StageState,
    pub progress: u8,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub required: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageSnapshot {
    pub fn not_started(required: bool, max_attempts: u32) -> Self {
        Self {
            state: StageState::NotStarted,
            progress: 0,
            failure_reason: None,
            attempts: 0,
            max_attempts,
            required,
            finished_at: None,
        }
    }

    pub fn from_task(task: &Task, required: bool) -> Self {
        Self {
            state: task.state.into(),
            progress: task.progress,
            failure_reason: task.failure_reason.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            required,
            finished_at: task.finished_at,
        }
    }
}

/// Merged view of one work item's pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub work_item_id: Uuid,
    pub run: i64,
    /// Status stored on the work item
    pub status: WorkItemStatus,
    /// Status derived from the stage snapshot
    pub projected_status: WorkItemStatus,
    pub processing_meta: ProcessingMeta,
    pub stages: BTreeMap<Stage, StageSnapshot>,
}

fn rank(status: WorkItemStatus) -> u8 {
    match status {
        WorkItemStatus::Scheduled => 0,
        WorkItemStatus::Pending => 1,
        WorkItemStatus::Processing => 2,
        WorkItemStatus::Transcribed => 3,
        WorkItemStatus::Completed => 4,
        WorkItemStatus::Failed => 4,
        WorkItemStatus::Cancelled => 5,
    }
}

/// Derive the work-item status from its stored status and the stage states.
///
/// Deterministic in its inputs. Terminal stored statuses are sticky, and the
/// result never ranks below the stored status, so a retry that puts the entry
/// task back to Waiting does not move a Processing item back to Pending.
/// Stages missing from `stages` count as not started.
pub fn project_status(
    stored: WorkItemStatus,
    topology: &PipelineTopology,
    stages: &BTreeMap<Stage, StageState>,
) -> WorkItemStatus {
    if stored.is_terminal() {
        return stored;
    }

    let state_of = |stage: Stage| stages.get(&stage).copied().unwrap_or(StageState::NotStarted);

    let required_failed = topology
        .active_stages()
        .any(|stage| topology.is_required(stage) && state_of(stage) == StageState::Failed);
    if required_failed {
        return WorkItemStatus::Failed;
    }

    let derived = match state_of(topology.entry()) {
        StageState::NotStarted => WorkItemStatus::Scheduled,
        StageState::Waiting | StageState::Delayed => WorkItemStatus::Pending,
        StageState::Active => WorkItemStatus::Processing,
        StageState::Failed => WorkItemStatus::Failed,
        StageState::Completed => {
            let all_required_done = topology
                .fan_out()
                .iter()
                .filter(|stage| topology.is_required(**stage))
                .all(|stage| state_of(*stage) == StageState::Completed);
            if all_required_done {
                WorkItemStatus::Completed
            } else {
                WorkItemStatus::Transcribed
            }
        }
    };

    if rank(derived) >= rank(stored) {
        derived
    } else {
        stored
    }
}
