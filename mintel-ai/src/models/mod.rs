//! Data models for the processing pipeline

pub mod output;
pub mod stage;
pub mod task;
pub mod work_item;

pub use output::{
    ActionItem, ExtractedItems, FollowUp, FollowUpDetections, MeetingTimeline,
    ParticipantSentiment, SentimentAnalysis, StageOutput, StageOutputs, TimelineEntry, Transcript,
    TranscriptSegment,
};
pub use stage::{PipelineTopology, RetentionPolicy, Stage, StagePolicy, StageRequirement};
pub use task::{NewTask, QueueStats, Task, TaskPayload, TaskState};
pub use work_item::{NewWorkItem, ProcessingMeta, WorkItem, WorkItemStatus};
