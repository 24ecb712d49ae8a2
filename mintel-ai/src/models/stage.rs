//! Pipeline stages and the per-stage policy table
//!
//! [`PipelineTopology`] is the single source of the required/optional
//! classification. The orchestrator's fan-in count and the status projection
//! both read it, so the two can never disagree.

use crate::queue::backoff::BackoffPolicy;
use mintel_common::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// One named step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Extraction,
    Sentiment,
    FollowUpDetection,
    Timeline,
}

impl Stage {
    /// Every stage, in fan-out submission order after the entry stage
    pub const ALL: [Stage; 5] = [
        Stage::Transcription,
        Stage::Extraction,
        Stage::Sentiment,
        Stage::FollowUpDetection,
        Stage::Timeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcription => "transcription",
            Stage::Extraction => "extraction",
            Stage::Sentiment => "sentiment",
            Stage::FollowUpDetection => "follow_up_detection",
            Stage::Timeline => "timeline",
        }
    }

    /// Deterministic task id `stage:workItemId`, the idempotency key of a submission
    pub fn task_id(&self, work_item_id: Uuid) -> String {
        format!("{}:{}", self.as_str(), work_item_id)
    }

    fn index(&self) -> usize {
        match self {
            Stage::Transcription => 0,
            Stage::Extraction => 1,
            Stage::Sentiment => 2,
            Stage::FollowUpDetection => 3,
            Stage::Timeline => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown stage: {}", s)))
    }
}

/// Whether a stage's terminal failure fails the whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRequirement {
    Required,
    Optional,
}

impl StageRequirement {
    pub fn is_required(&self) -> bool {
        matches!(self, StageRequirement::Required)
    }
}

/// Bounds for garbage-collecting finished tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: u32,
    pub completed_max_age: Duration,
    pub keep_failed: u32,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 1000,
            completed_max_age: Duration::from_secs(24 * 3600),
            keep_failed: 5000,
            failed_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Execution policy for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    pub requirement: StageRequirement,
    /// Disabled fan-out stages are never enqueued
    pub enabled: bool,
    /// Tasks in flight per stage
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Worker-side execution timeout for one attempt
    pub timeout: Duration,
    /// An Active task without a heartbeat for this long is considered stalled
    pub stall_timeout: Duration,
    /// Lower is served first
    pub priority: i64,
    pub retention: RetentionPolicy,
}

impl StagePolicy {
    pub fn defaults_for(stage: Stage) -> Self {
        let analysis = StagePolicy {
            requirement: StageRequirement::Required,
            enabled: true,
            concurrency: 3,
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(120)),
            timeout: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(120),
            priority: 0,
            retention: RetentionPolicy::default(),
        };

        match stage {
            Stage::Transcription => StagePolicy {
                concurrency: 2,
                backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
                timeout: Duration::from_secs(30 * 60),
                stall_timeout: Duration::from_secs(300),
                ..analysis
            },
            Stage::Extraction | Stage::Sentiment => analysis,
            Stage::FollowUpDetection => StagePolicy {
                requirement: StageRequirement::Optional,
                max_attempts: 2,
                ..analysis
            },
            Stage::Timeline => StagePolicy {
                requirement: StageRequirement::Optional,
                enabled: false,
                max_attempts: 2,
                ..analysis
            },
        }
    }
}

/// Entry stage, ordered fan-out list and the policy of every stage
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineTopology {
    policies: [StagePolicy; 5],
    fan_out: Vec<Stage>,
}

impl PipelineTopology {
    pub const ENTRY: Stage = Stage::Transcription;

    /// Build from a policy lookup. The entry stage is always required and enabled.
    pub fn from_policies(mut policy_for: impl FnMut(Stage) -> StagePolicy) -> Self {
        let policies = Stage::ALL.map(|stage| {
            let mut policy = policy_for(stage);
            if stage == Self::ENTRY {
                policy.requirement = StageRequirement::Required;
                policy.enabled = true;
            }
            policy
        });

        let fan_out = Stage::ALL
            .into_iter()
            .filter(|stage| *stage != Self::ENTRY && policies[stage.index()].enabled)
            .collect();

        Self { policies, fan_out }
    }

    /// Replace one stage's policy
    pub fn with_policy(self, stage: Stage, policy: StagePolicy) -> Self {
        let mut policies = self.policies;
        policies[stage.index()] = policy;
        Self::from_policies(|s| policies[s.index()].clone())
    }

    pub fn entry(&self) -> Stage {
        Self::ENTRY
    }

    /// Enabled dependent stages, in fixed submission order
    pub fn fan_out(&self) -> &[Stage] {
        &self.fan_out
    }

    /// Entry stage followed by the fan-out stages
    pub fn active_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        std::iter::once(Self::ENTRY).chain(self.fan_out.iter().copied())
    }

    pub fn policy(&self, stage: Stage) -> &StagePolicy {
        &self.policies[stage.index()]
    }

    pub fn is_required(&self, stage: Stage) -> bool {
        self.policy(stage).requirement.is_required()
    }

    /// Number of fan-out stages the work item waits for before it completes
    pub fn required_fan_out_count(&self) -> usize {
        self.fan_out.iter().filter(|s| self.is_required(**s)).count()
    }
}

impl Default for PipelineTopology {
    fn default() -> Self {
        Self::from_policies(StagePolicy::defaults_for)
    }
}
