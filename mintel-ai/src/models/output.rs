//! Stage outputs stored on the work item
//!
//! Each output belongs to exactly one stage and is written as a whole, so a
//! re-run replaces it instead of appending to it.

use super::stage::Stage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    #[serde(default)]
    pub speaker: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub duration_seconds: f64,
    pub language_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub description: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItems {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSentiment {
    pub name: String,
    /// -1.0 (negative) to 1.0 (positive)
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentAnalysis {
    pub overall: String,
    /// -1.0 (negative) to 1.0 (positive)
    pub score: f64,
    #[serde(default)]
    pub participants: Vec<ParticipantSentiment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub description: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub due_hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpDetections {
    #[serde(default)]
    pub follow_ups: Vec<FollowUp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at_seconds: f64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeetingTimeline {
    #[serde(default)]
    pub entries: Vec<TimelineEntry>,
}

/// The output of one stage, tagged by stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StageOutput {
    Transcription(Transcript),
    Extraction(ExtractedItems),
    Sentiment(SentimentAnalysis),
    FollowUpDetection(FollowUpDetections),
    Timeline(MeetingTimeline),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Transcription(_) => Stage::Transcription,
            StageOutput::Extraction(_) => Stage::Extraction,
            StageOutput::Sentiment(_) => Stage::Sentiment,
            StageOutput::FollowUpDetection(_) => Stage::FollowUpDetection,
            StageOutput::Timeline(_) => Stage::Timeline,
        }
    }

    /// Small summary persisted as the task result
    pub fn summary(&self) -> serde_json::Value {
        match self {
            StageOutput::Transcription(t) => serde_json::json!({
                "characters": t.text.len(),
                "segments": t.segments.len(),
                "duration_seconds": t.duration_seconds,
                "language_code": t.language_code,
            }),
            StageOutput::Extraction(e) => serde_json::json!({
                "action_items": e.action_items.len(),
                "decisions": e.decisions.len(),
                "topics": e.topics.len(),
            }),
            StageOutput::Sentiment(s) => serde_json::json!({
                "overall": s.overall,
                "score": s.score,
            }),
            StageOutput::FollowUpDetection(f) => serde_json::json!({
                "follow_ups": f.follow_ups.len(),
            }),
            StageOutput::Timeline(t) => serde_json::json!({
                "entries": t.entries.len(),
            }),
        }
    }
}

/// All stage outputs of a work item
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutputs {
    pub transcript: Option<Transcript>,
    pub extracted_items: Option<ExtractedItems>,
    pub sentiment: Option<SentimentAnalysis>,
    pub follow_ups: Option<FollowUpDetections>,
    pub timeline: Option<MeetingTimeline>,
}

impl StageOutputs {
    pub fn set(&mut self, output: StageOutput) {
        match output {
            StageOutput::Transcription(t) => self.transcript = Some(t),
            StageOutput::Extraction(e) => self.extracted_items = Some(e),
            StageOutput::Sentiment(s) => self.sentiment = Some(s),
            StageOutput::FollowUpDetection(f) => self.follow_ups = Some(f),
            StageOutput::Timeline(t) => self.timeline = Some(t),
        }
    }
}
