//! External AI capabilities
//!
//! The pipeline only sees these traits. [`http`] provides the production
//! clients; tests substitute scripted fakes.

pub mod http;

use crate::models::TranscriptSegment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpAnalysisEngine, HttpTranscriptionEngine};

#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Connection, DNS or timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by {0}")]
    RateLimited(String),

    #[error("{service} returned HTTP {status}: {message}")]
    Remote {
        service: String,
        status: u16,
        message: String,
    },

    /// Response body did not decode
    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("capability not configured: {0}")]
    NotConfigured(String),
}

impl CapabilityError {
    /// Transport trouble, rate limits and server errors are worth retrying;
    /// client errors (bad input, unsupported format) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CapabilityError::Transport(_) => true,
            CapabilityError::RateLimited(_) => true,
            CapabilityError::Remote { status, .. } => *status >= 500,
            CapabilityError::Decode(_) => true,
            CapabilityError::NotConfigured(_) => false,
        }
    }
}

/// Speech-to-text result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub duration_seconds: f64,
    pub language_code: String,
    /// Cost of the call, when the provider reports one
    #[serde(default)]
    pub cost: Option<f64>,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transcribe the recording at `source_locator`. May take minutes.
    async fn transcribe(&self, source_locator: &str) -> Result<Transcription, CapabilityError>;
}

/// Which analysis to run over a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Extraction,
    Sentiment,
    FollowUps,
    Timeline,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest<'a> {
    pub kind: AnalysisKind,
    pub transcript: &'a str,
    pub participants: &'a [String],
}

/// Raw structured result; each stage parses it into its own output type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub result: serde_json::Value,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResponse, CapabilityError>;
}

/// Stand-in used when no endpoint is configured; every call fails non-retriably
pub struct UnconfiguredCapability;

#[async_trait]
impl TranscriptionEngine for UnconfiguredCapability {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn transcribe(&self, _source_locator: &str) -> Result<Transcription, CapabilityError> {
        Err(CapabilityError::NotConfigured(
            "transcription_url is not set".to_string(),
        ))
    }
}

#[async_trait]
impl AnalysisEngine for UnconfiguredCapability {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn analyze(&self, _request: AnalysisRequest<'_>) -> Result<AnalysisResponse, CapabilityError> {
        Err(CapabilityError::NotConfigured("analysis_url is not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CapabilityError::Transport("reset".into()).is_retryable());
        assert!(CapabilityError::RateLimited("stt".into()).is_retryable());
        assert!(CapabilityError::Remote {
            service: "stt".into(),
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!CapabilityError::Remote {
            service: "stt".into(),
            status: 415,
            message: "unsupported media type".into()
        }
        .is_retryable());
        assert!(!CapabilityError::NotConfigured("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_unconfigured_capability_fails() {
        let err = UnconfiguredCapability.transcribe("file:///a.wav").await.unwrap_err();
        assert!(!err.is_retryable());

        let err = UnconfiguredCapability
            .analyze(AnalysisRequest {
                kind: AnalysisKind::Sentiment,
                transcript: "hi",
                participants: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::NotConfigured(_)));
    }
}
