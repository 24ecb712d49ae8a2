//! Stage lifecycle events, consumed by the orchestrator

use crate::models::{Stage, Task};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEventKind {
    /// Task claimed by a worker
    Started { attempt: u32 },
    /// Task reached Completed
    Completed,
    /// Task reached Failed with no retries left (or a non-retriable error)
    Exhausted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: Stage,
    pub task_id: String,
    pub work_item_id: Uuid,
    /// Pipeline run the task belongs to
    pub run: i64,
    pub kind: StageEventKind,
}

impl StageEvent {
    pub fn new(task: &Task, kind: StageEventKind) -> Self {
        Self {
            stage: task.stage,
            task_id: task.id.clone(),
            work_item_id: task.work_item_id,
            run: task.run,
            kind,
        }
    }
}
