//! Stage handlers: call the capability, validate, shape the output

use super::{StageError, StageHandler, StageResult, TaskContext};
use crate::capabilities::{AnalysisEngine, AnalysisKind, AnalysisRequest, Transcription, TranscriptionEngine};
use crate::models::{
    ExtractedItems, FollowUpDetections, MeetingTimeline, SentimentAnalysis, Stage, StageOutput,
    TaskPayload, Transcript,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub struct TranscriptionHandler {
    engine: Arc<dyn TranscriptionEngine>,
}

impl TranscriptionHandler {
    pub fn new(engine: Arc<dyn TranscriptionEngine>) -> Self {
        Self { engine }
    }
}

/// Reject transcriptions that cannot be right
fn validate_transcription(transcription: Transcription) -> Result<(Transcript, f64), StageError> {
    if !transcription.duration_seconds.is_finite() || transcription.duration_seconds < 0.0 {
        return Err(StageError::MalformedResult(format!(
            "invalid duration_seconds: {}",
            transcription.duration_seconds
        )));
    }
    if transcription.language_code.trim().is_empty() {
        return Err(StageError::MalformedResult("missing language_code".to_string()));
    }
    if let Some(segment) = transcription.segments.iter().find(|s| {
        !s.start_seconds.is_finite() || !s.end_seconds.is_finite() || s.start_seconds > s.end_seconds
    }) {
        return Err(StageError::MalformedResult(format!(
            "segment has invalid bounds: {}..{}",
            segment.start_seconds, segment.end_seconds
        )));
    }

    let cost = transcription.cost.unwrap_or(0.0);
    Ok((
        Transcript {
            text: transcription.text,
            segments: transcription.segments,
            duration_seconds: transcription.duration_seconds,
            language_code: transcription.language_code,
        },
        cost,
    ))
}

#[async_trait]
impl StageHandler for TranscriptionHandler {
    fn stage(&self) -> Stage {
        Stage::Transcription
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<StageResult, StageError> {
        let TaskPayload::Transcription { source_locator, .. } = &ctx.task.payload else {
            return Err(StageError::UnsupportedInput(
                "transcription stage needs a transcription payload".to_string(),
            ));
        };

        ctx.ensure_not_cancelled()?;
        ctx.progress.report(10).await;

        let transcription = self.engine.transcribe(source_locator).await?;

        ctx.progress.report(90).await;
        ctx.ensure_not_cancelled()?;

        let (transcript, cost) = validate_transcription(transcription)?;
        Ok(StageResult {
            output: StageOutput::Transcription(transcript),
            cost,
        })
    }
}

/// One handler type for every transcript-analysis stage
pub struct AnalysisHandler {
    stage: Stage,
    kind: AnalysisKind,
    engine: Arc<dyn AnalysisEngine>,
}

impl AnalysisHandler {
    /// Handler for a fan-out stage; `None` for the entry stage
    pub fn for_stage(stage: Stage, engine: Arc<dyn AnalysisEngine>) -> Option<Self> {
        let kind = match stage {
            Stage::Transcription => return None,
            Stage::Extraction => AnalysisKind::Extraction,
            Stage::Sentiment => AnalysisKind::Sentiment,
            Stage::FollowUpDetection => AnalysisKind::FollowUps,
            Stage::Timeline => AnalysisKind::Timeline,
        };
        Some(Self { stage, kind, engine })
    }
}

fn decode<T: DeserializeOwned>(kind: AnalysisKind, value: serde_json::Value) -> Result<T, StageError> {
    if !value.is_object() {
        return Err(StageError::MalformedResult(format!(
            "{:?} result is not a JSON object",
            kind
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| StageError::MalformedResult(format!("{:?} result: {}", kind, e)))
}

/// Parse a raw analysis result into the stage's output type
pub fn parse_analysis(kind: AnalysisKind, value: serde_json::Value) -> Result<StageOutput, StageError> {
    match kind {
        AnalysisKind::Extraction => decode::<ExtractedItems>(kind, value).map(StageOutput::Extraction),
        AnalysisKind::Sentiment => {
            let sentiment: SentimentAnalysis = decode(kind, value)?;
            let out_of_range = |score: f64| !(-1.0..=1.0).contains(&score);
            if out_of_range(sentiment.score) || sentiment.participants.iter().any(|p| out_of_range(p.score)) {
                return Err(StageError::MalformedResult(
                    "sentiment score outside -1.0..=1.0".to_string(),
                ));
            }
            Ok(StageOutput::Sentiment(sentiment))
        }
        AnalysisKind::FollowUps => {
            decode::<FollowUpDetections>(kind, value).map(StageOutput::FollowUpDetection)
        }
        AnalysisKind::Timeline => decode::<MeetingTimeline>(kind, value).map(StageOutput::Timeline),
    }
}

#[async_trait]
impl StageHandler for AnalysisHandler {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<StageResult, StageError> {
        let TaskPayload::Analysis {
            transcript_text,
            participants,
            ..
        } = &ctx.task.payload
        else {
            return Err(StageError::UnsupportedInput(format!(
                "{} stage needs an analysis payload",
                self.stage
            )));
        };

        ctx.ensure_not_cancelled()?;
        ctx.progress.report(10).await;

        let response = self
            .engine
            .analyze(AnalysisRequest {
                kind: self.kind,
                transcript: transcript_text,
                participants,
            })
            .await?;

        ctx.progress.report(80).await;
        ctx.ensure_not_cancelled()?;

        let output = parse_analysis(self.kind, response.result)?;
        Ok(StageResult {
            output,
            cost: response.cost.unwrap_or(0.0),
        })
    }
}
