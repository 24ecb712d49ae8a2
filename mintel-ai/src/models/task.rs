//! Queued stage tasks

use super::stage::Stage;
use chrono::{DateTime, Utc};
use mintel_common::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Task lifecycle state, owned by the stage queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Delayed => "delayed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "active" => Ok(TaskState::Active),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "delayed" => Ok(TaskState::Delayed),
            other => Err(Error::Internal(format!("Unknown task state: {}", other))),
        }
    }
}

/// Stage-specific task input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Entry stage: where the recording lives
    Transcription {
        work_item_id: Uuid,
        source_locator: String,
        size_bytes: i64,
        requester_id: String,
    },
    /// Fan-out stages: the finished transcript
    Analysis {
        work_item_id: Uuid,
        transcript_text: String,
        participants: Vec<String>,
        language_code: Option<String>,
    },
}

impl TaskPayload {
    pub fn work_item_id(&self) -> Uuid {
        match self {
            TaskPayload::Transcription { work_item_id, .. } => *work_item_id,
            TaskPayload::Analysis { work_item_id, .. } => *work_item_id,
        }
    }
}

/// Submission to a stage queue
#[derive(Debug, Clone)]
pub struct NewTask {
    pub stage: Stage,
    pub work_item_id: Uuid,
    /// Pipeline run generation of the work item
    pub run: i64,
    pub payload: TaskPayload,
    pub priority: i64,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn id(&self) -> String {
        self.stage.task_id(self.work_item_id)
    }
}

/// A task as stored by its queue
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub stage: Stage,
    pub work_item_id: Uuid,
    pub run: i64,
    pub payload: TaskPayload,
    pub state: TaskState,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Advisory 0-100
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a Delayed task becomes Waiting again
    pub available_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Task counts per state for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueStats {
    pub fn add(&mut self, state: TaskState, count: u64) {
        match state {
            TaskState::Waiting => self.waiting += count,
            TaskState::Active => self.active += count,
            TaskState::Completed => self.completed += count,
            TaskState::Failed => self.failed += count,
            TaskState::Delayed => self.delayed += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let id = Uuid::new_v4();
        let payload = TaskPayload::Transcription {
            work_item_id: id,
            source_locator: "s3://bucket/rec.m4a".to_string(),
            size_bytes: 1024,
            requester_id: "user-1".to_string(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "transcription");
        assert_eq!(payload.work_item_id(), id);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Delayed.is_terminal());
        assert!(!TaskState::Active.is_terminal());
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = QueueStats::default();
        stats.add(TaskState::Waiting, 2);
        stats.add(TaskState::Failed, 1);
        stats.add(TaskState::Waiting, 1);
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }
}
