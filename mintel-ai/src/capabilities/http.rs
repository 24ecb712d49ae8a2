//! HTTP clients for the transcription and analysis services
//!
//! Both services take a JSON POST and answer with JSON. Errors are classified
//! so the worker can decide between retry and terminal failure.

use super::{
    AnalysisEngine, AnalysisRequest, AnalysisResponse, CapabilityError, Transcription,
    TranscriptionEngine,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("mintel-ai/", env!("CARGO_PKG_VERSION"));

fn build_client(timeout: Duration) -> Result<Client, CapabilityError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| CapabilityError::Transport(format!("failed to build HTTP client: {}", e)))
}

/// POST `body` as JSON and decode a JSON answer
async fn post_json<B, T>(client: &Client, service: &str, url: &str, body: &B) -> Result<T, CapabilityError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| CapabilityError::Transport(e.to_string()))?;

    let status = response.status();
    debug!(service, status = status.as_u16(), "Capability response");

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CapabilityError::RateLimited(service.to_string()));
    }

    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(CapabilityError::Remote {
            service: service.to_string(),
            status: status.as_u16(),
            message,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|e| CapabilityError::Decode(e.to_string()))
}

/// Speech-to-text over HTTP: `POST {base}/transcribe {"source_locator"}`
pub struct HttpTranscriptionEngine {
    http_client: Client,
    endpoint: String,
}

impl HttpTranscriptionEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CapabilityError> {
        Ok(Self {
            http_client: build_client(timeout)?,
            endpoint: format!("{}/transcribe", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    source_locator: &'a str,
}

#[async_trait]
impl TranscriptionEngine for HttpTranscriptionEngine {
    fn name(&self) -> &'static str {
        "http-transcription"
    }

    async fn transcribe(&self, source_locator: &str) -> Result<Transcription, CapabilityError> {
        post_json(
            &self.http_client,
            self.name(),
            &self.endpoint,
            &TranscribeRequest { source_locator },
        )
        .await
    }
}

/// Generative analysis over HTTP: `POST {base}/analyze {"kind", "transcript", "participants"}`
pub struct HttpAnalysisEngine {
    http_client: Client,
    endpoint: String,
}

impl HttpAnalysisEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CapabilityError> {
        Ok(Self {
            http_client: build_client(timeout)?,
            endpoint: format!("{}/analyze", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    fn name(&self) -> &'static str {
        "http-analysis"
    }

    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResponse, CapabilityError> {
        post_json(&self.http_client, self.name(), &self.endpoint, &request).await
    }
}
