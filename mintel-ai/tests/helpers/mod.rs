//! Shared fixtures for the pipeline integration tests
//!
//! Tests use a throwaway on-disk database (a pooled in-memory database cannot
//! serve the nested connections the queue and orchestrator take) and scripted
//! capability fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use mintel_ai::capabilities::{
    AnalysisEngine, AnalysisKind, AnalysisRequest, AnalysisResponse, CapabilityError, Transcription,
    TranscriptionEngine,
};
use mintel_ai::db::{init_database_pool, work_items};
use mintel_ai::models::{
    ExtractedItems, FollowUpDetections, MeetingTimeline, NewWorkItem, PipelineTopology,
    SentimentAnalysis, Stage, StageOutput, StagePolicy, Task, Transcript, TranscriptSegment,
    WorkItem, WorkItemStatus,
};
use mintel_ai::orchestrator::PipelineOrchestrator;
use mintel_ai::queue::backoff::BackoffPolicy;
use mintel_ai::queue::maintenance::run_maintenance;
use mintel_ai::queue::{ClaimedTask, CommitOutcome, FailOutcome, StageEvent, StageQueue, StageQueues};
use mintel_ai::worker::{AnalysisHandler, StageHandler, StageWorker, TranscriptionHandler};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const POLL: Duration = Duration::from_millis(10);

/// Database in a temp dir that lives as long as this value
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = init_database_pool(&dir.path().join("test.db"))
        .await
        .expect("init database");
    TestDb { pool, _dir: dir }
}

/// Default policies with millisecond backoff
pub fn fast_policy(stage: Stage) -> StagePolicy {
    StagePolicy {
        backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(30),
        ..StagePolicy::defaults_for(stage)
    }
}

pub fn fast_topology() -> PipelineTopology {
    PipelineTopology::from_policies(fast_policy)
}

pub fn submission() -> NewWorkItem {
    NewWorkItem {
        requester_id: "user-1".to_string(),
        source_locator: "s3://recordings/standup.m4a".to_string(),
        size_bytes: 4_200_000,
        participants: vec!["Ann".to_string(), "Bo".to_string()],
    }
}

pub fn sample_transcript() -> Transcript {
    Transcript {
        text: "Ann: ship it Friday. Bo: I will send the notes.".to_string(),
        segments: vec![TranscriptSegment {
            start_seconds: 0.0,
            end_seconds: 4.0,
            speaker: Some("Ann".to_string()),
            text: "ship it Friday".to_string(),
        }],
        duration_seconds: 4.0,
        language_code: "en".to_string(),
    }
}

/// A valid output for `stage`
pub fn sample_output(stage: Stage) -> StageOutput {
    match stage {
        Stage::Transcription => StageOutput::Transcription(sample_transcript()),
        Stage::Extraction => StageOutput::Extraction(ExtractedItems {
            summary: Some("Release planning".to_string()),
            action_items: Vec::new(),
            decisions: vec!["Ship Friday".to_string()],
            topics: vec!["release".to_string()],
        }),
        Stage::Sentiment => StageOutput::Sentiment(SentimentAnalysis {
            overall: "positive".to_string(),
            score: 0.6,
            participants: Vec::new(),
        }),
        Stage::FollowUpDetection => StageOutput::FollowUpDetection(FollowUpDetections::default()),
        Stage::Timeline => StageOutput::Timeline(MeetingTimeline::default()),
    }
}

fn analysis_result(kind: AnalysisKind) -> serde_json::Value {
    match kind {
        AnalysisKind::Extraction => json!({
            "summary": "Release planning",
            "action_items": [{"description": "Send the notes", "owner": "Bo"}],
            "decisions": ["Ship Friday"],
            "topics": ["release"]
        }),
        AnalysisKind::Sentiment => json!({"overall": "positive", "score": 0.6}),
        AnalysisKind::FollowUps => json!({"follow_ups": [{"description": "Check release status"}]}),
        AnalysisKind::Timeline => json!({"entries": [{"at_seconds": 0.0, "title": "Kickoff"}]}),
    }
}

fn unavailable(service: &str) -> CapabilityError {
    CapabilityError::Remote {
        service: service.to_string(),
        status: 503,
        message: "unavailable".to_string(),
    }
}

/// Transcription fake: fails the first `failures` calls with a retriable 503
pub struct FakeTranscription {
    failures: AtomicU32,
    delay: Duration,
    pub calls: AtomicU32,
}

impl FakeTranscription {
    pub fn ok() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(u32::MAX)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(0),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionEngine for FakeTranscription {
    fn name(&self) -> &'static str {
        "fake-transcription"
    }

    async fn transcribe(&self, _source_locator: &str) -> Result<Transcription, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(unavailable("fake-transcription"));
        }

        let transcript = sample_transcript();
        Ok(Transcription {
            text: transcript.text,
            segments: transcript.segments,
            duration_seconds: transcript.duration_seconds,
            language_code: transcript.language_code,
            cost: Some(0.25),
        })
    }
}

/// Analysis fake with per-kind scripted failures
pub struct FakeAnalysis {
    failures: Mutex<HashMap<AnalysisKind, u32>>,
    malformed: Mutex<Vec<AnalysisKind>>,
    calls: Mutex<HashMap<AnalysisKind, u32>>,
}

impl FakeAnalysis {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            malformed: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every `kind` call with a retriable error
    pub fn always_failing(kind: AnalysisKind) -> Arc<Self> {
        let fake = Self::new();
        fake.failures.lock().unwrap().insert(kind, u32::MAX);
        Arc::new(fake)
    }

    /// Answer `kind` with prose instead of JSON
    pub fn malformed(kind: AnalysisKind) -> Arc<Self> {
        let fake = Self::new();
        fake.malformed.lock().unwrap().push(kind);
        Arc::new(fake)
    }

    pub fn calls(&self, kind: AnalysisKind) -> u32 {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AnalysisEngine for FakeAnalysis {
    fn name(&self) -> &'static str {
        "fake-analysis"
    }

    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResponse, CapabilityError> {
        let kind = request.kind;
        *self.calls.lock().unwrap().entry(kind).or_insert(0) += 1;

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&kind) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(unavailable("fake-analysis"));
                }
            }
        }

        if self.malformed.lock().unwrap().contains(&kind) {
            return Ok(AnalysisResponse {
                result: json!("Here is a summary of the meeting."),
                cost: None,
            });
        }

        Ok(AnalysisResponse {
            result: analysis_result(kind),
            cost: Some(0.05),
        })
    }
}

/// Queues and orchestrator without background loops; the test drives every step
pub struct ManualPipeline {
    pub db: TestDb,
    pub queues: StageQueues,
    pub orchestrator: PipelineOrchestrator,
    pub events: mpsc::Receiver<StageEvent>,
}

impl ManualPipeline {
    pub async fn new() -> Self {
        Self::with_topology(fast_topology()).await
    }

    pub async fn with_topology(topology: PipelineTopology) -> Self {
        let db = test_db().await;
        let (tx, events) = mpsc::channel(256);
        let queues = StageQueues::new(db.pool.clone(), &topology, POLL, tx);
        let orchestrator = PipelineOrchestrator::new(db.pool.clone(), queues.clone(), topology);
        Self {
            db,
            queues,
            orchestrator,
            events,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db.pool
    }

    pub fn queue(&self, stage: Stage) -> Arc<StageQueue> {
        self.queues.get(stage).expect("stage queue").clone()
    }

    /// Hand every pending stage event to the orchestrator; returns how many
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.orchestrator.handle_event(&event).await.expect("handle event");
            handled += 1;
        }
        handled
    }

    /// Drop pending events, simulating a crash between task write and orchestration
    pub fn lose_events(&mut self) -> usize {
        let mut lost = 0;
        while self.events.try_recv().is_ok() {
            lost += 1;
        }
        lost
    }

    pub async fn claim(&self, stage: Stage) -> ClaimedTask {
        self.queue(stage)
            .try_claim()
            .await
            .expect("claim")
            .unwrap_or_else(|| panic!("no {} task to claim", stage))
    }

    /// Claim the next `stage` task and complete it the way a worker does
    pub async fn complete_next(&mut self, stage: Stage) -> Task {
        let claimed = self.claim(stage).await;
        let output = sample_output(stage);
        let task = claimed.task.clone();

        work_items::save_stage_output(self.pool(), task.work_item_id, task.run, &output, 0.1)
            .await
            .expect("save output");
        let outcome = self
            .queue(stage)
            .complete(&claimed, &output.summary())
            .await
            .expect("complete");
        assert_eq!(outcome, CommitOutcome::Committed);

        self.pump().await;
        task
    }

    /// Claim the next `stage` task and fail the attempt
    pub async fn fail_next(&mut self, stage: Stage, reason: &str, retryable: bool) -> FailOutcome {
        let claimed = self.claim(stage).await;
        let outcome = self
            .queue(stage)
            .fail(&claimed, reason, retryable)
            .await
            .expect("fail");
        self.pump().await;
        outcome
    }

    pub async fn task(&self, stage: Stage, work_item_id: Uuid) -> Option<Task> {
        self.queue(stage)
            .get_status(&stage.task_id(work_item_id))
            .await
            .expect("task status")
    }

    pub async fn item(&self, work_item_id: Uuid) -> WorkItem {
        self.orchestrator.get_work_item(work_item_id).await.expect("work item")
    }
}

/// Full pipeline with workers, maintenance and the orchestrator loop running
pub struct RunningPipeline {
    pub db: TestDb,
    pub orchestrator: PipelineOrchestrator,
    shutdown: CancellationToken,
    background: JoinSet<()>,
}

impl RunningPipeline {
    pub async fn start(
        topology: PipelineTopology,
        transcription: Arc<dyn TranscriptionEngine>,
        analysis: Arc<dyn AnalysisEngine>,
    ) -> Self {
        let db = test_db().await;
        let (tx, rx) = mpsc::channel(256);
        let queues = StageQueues::new(db.pool.clone(), &topology, POLL, tx);
        let orchestrator = PipelineOrchestrator::new(db.pool.clone(), queues.clone(), topology.clone());

        let shutdown = CancellationToken::new();
        let mut background = JoinSet::new();

        let mut handlers: Vec<Arc<dyn StageHandler>> = vec![Arc::new(TranscriptionHandler::new(transcription))];
        for stage in topology.fan_out() {
            if let Some(handler) = AnalysisHandler::for_stage(*stage, analysis.clone()) {
                handlers.push(Arc::new(handler));
            }
        }

        for handler in handlers {
            let queue = queues.get(handler.stage()).expect("stage queue").clone();
            let worker = StageWorker::new(db.pool.clone(), queue, handler, Duration::from_millis(50));
            background.spawn(worker.run(shutdown.clone()));
        }

        for (_, queue) in queues.iter() {
            background.spawn(run_maintenance(queue.clone(), Duration::from_millis(20), shutdown.clone()));
        }

        {
            let orchestrator = orchestrator.clone();
            let shutdown = shutdown.clone();
            background.spawn(async move { orchestrator.run(rx, Duration::from_millis(50), shutdown).await });
        }

        Self {
            db,
            orchestrator,
            shutdown,
            background,
        }
    }

    pub async fn default_with(
        transcription: Arc<dyn TranscriptionEngine>,
        analysis: Arc<dyn AnalysisEngine>,
    ) -> Self {
        Self::start(fast_topology(), transcription, analysis).await
    }

    /// Poll until the item reaches `expected`; panics after 10 seconds
    pub async fn wait_for_status(&self, work_item_id: Uuid, expected: WorkItemStatus) -> WorkItem {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let item = self.orchestrator.get_work_item(work_item_id).await.expect("work item");
            if item.status == expected {
                return item;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("work item stuck in {} waiting for {}", item.status, expected);
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Poll until `check` holds for the stage's task; panics after 10 seconds
    pub async fn wait_for_task(&self, stage: Stage, work_item_id: Uuid, check: impl Fn(&Task) -> bool) -> Task {
        let queue = self.orchestrator.queues().get(stage).expect("stage queue").clone();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(task) = queue.get_status(&stage.task_id(work_item_id)).await.expect("task status") {
                if check(&task) {
                    return task;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("{} task of {} never reached the expected state", stage, work_item_id);
            }
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        while self.background.join_next().await.is_some() {}
    }
}
