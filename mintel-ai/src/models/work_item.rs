//! Work-item record: the externally visible unit of work
//!
//! Status only moves forward along the pipeline. The two ways back are an
//! explicit cancel and an explicit re-submission, which starts a new run.

use super::output::StageOutputs;
use chrono::{DateTime, Utc};
use mintel_common::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Scheduled,
    Pending,
    Processing,
    Transcribed,
    Completed,
    Cancelled,
    Failed,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 7] = [
        WorkItemStatus::Scheduled,
        WorkItemStatus::Pending,
        WorkItemStatus::Processing,
        WorkItemStatus::Transcribed,
        WorkItemStatus::Completed,
        WorkItemStatus::Cancelled,
        WorkItemStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Scheduled => "scheduled",
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Processing => "processing",
            WorkItemStatus::Transcribed => "transcribed",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Cancelled => "cancelled",
            WorkItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Cancelled | WorkItemStatus::Failed
        )
    }

    /// A pipeline run is underway
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Pending | WorkItemStatus::Processing | WorkItemStatus::Transcribed
        )
    }

    /// Forward transitions of one pipeline run, plus cancel from anywhere
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        use WorkItemStatus::*;

        match (self, next) {
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            (Scheduled, Pending) => true,
            (Pending, Processing | Transcribed | Failed) => true,
            (Processing, Transcribed | Failed) => true,
            (Transcribed, Completed | Failed) => true,
            _ => false,
        }
    }

    /// States from which `next` may be entered; the guard set of a compare-and-set
    pub fn predecessors(next: WorkItemStatus) -> Vec<WorkItemStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    /// Statuses a re-submission may restart from
    pub fn can_resubmit(&self) -> bool {
        self.is_terminal() || matches!(self, WorkItemStatus::Scheduled)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("Unknown work item status: {}", s)))
    }
}

/// Processing bookkeeping for the current run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMeta {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sum of capability cost reported by every stage of this run
    pub cost: f64,
    pub error: Option<String>,
}

/// Submission from the upload flow
#[derive(Debug, Clone, Deserialize)]
pub struct NewWorkItem {
    pub requester_id: String,
    pub source_locator: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub participants: Vec<String>,
}

impl NewWorkItem {
    pub fn validate(&self) -> mintel_common::Result<()> {
        if self.source_locator.trim().is_empty() {
            return Err(Error::InvalidInput("source_locator must not be empty".to_string()));
        }
        if self.requester_id.trim().is_empty() {
            return Err(Error::InvalidInput("requester_id must not be empty".to_string()));
        }
        if self.size_bytes < 0 {
            return Err(Error::InvalidInput(format!(
                "size_bytes must not be negative (got {})",
                self.size_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub requester_id: String,
    pub source_locator: String,
    pub size_bytes: i64,
    pub participants: Vec<String>,
    pub status: WorkItemStatus,
    /// Pipeline run generation, bumped by each re-submission
    pub run: i64,
    pub processing_meta: ProcessingMeta,
    pub outputs: StageOutputs,
    /// Required fan-out stages still outstanding
    pub fan_out_remaining: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(submission: NewWorkItem) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requester_id: submission.requester_id,
            source_locator: submission.source_locator,
            size_bytes: submission.size_bytes,
            participants: submission.participants,
            status: WorkItemStatus::Scheduled,
            run: 1,
            processing_meta: ProcessingMeta::default(),
            outputs: StageOutputs::default(),
            fan_out_remaining: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkItemStatus::*;

    #[test]
    fn test_happy_path_is_forward() {
        let path = [Scheduled, Pending, Processing, Transcribed, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_no_regression_from_terminal() {
        for next in WorkItemStatus::ALL {
            if next != Cancelled {
                assert!(!Completed.can_transition_to(next));
                assert!(!Failed.can_transition_to(next));
            }
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_cancel_from_any_live_status() {
        for from in WorkItemStatus::ALL {
            assert_eq!(from.can_transition_to(Cancelled), from != Cancelled);
        }
    }

    #[test]
    fn test_predecessors_of_completed() {
        assert_eq!(WorkItemStatus::predecessors(Completed), vec![Transcribed]);
        assert_eq!(
            WorkItemStatus::predecessors(Failed),
            vec![Pending, Processing, Transcribed]
        );
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in WorkItemStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkItemStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_new_work_item_validation() {
        let good = NewWorkItem {
            requester_id: "u1".to_string(),
            source_locator: "file:///tmp/a.wav".to_string(),
            size_bytes: 10,
            participants: vec![],
        };
        assert!(good.validate().is_ok());

        let empty_source = NewWorkItem {
            source_locator: "  ".to_string(),
            ..good.clone()
        };
        assert!(empty_source.validate().is_err());

        let negative = NewWorkItem {
            size_bytes: -1,
            ..good
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_new_item_starts_scheduled() {
        let item = WorkItem::new(NewWorkItem {
            requester_id: "u1".to_string(),
            source_locator: "file:///tmp/a.wav".to_string(),
            size_bytes: 10,
            participants: vec!["Ann".to_string()],
        });
        assert_eq!(item.status, Scheduled);
        assert_eq!(item.run, 1);
        assert!(item.processing_meta.started_at.is_none());
    }
}
