//! Runtime pipeline configuration
//!
//! Stage policies live in the `settings` table under `stage.<name>.<field>`,
//! pipeline-wide timings under `pipeline.<field>`. Missing keys take their
//! defaults and the defaults are written back, so the effective configuration
//! is always visible in the database.

use crate::models::{PipelineTopology, RetentionPolicy, Stage, StagePolicy, StageRequirement};
use crate::queue::backoff::BackoffPolicy;
use mintel_common::db::get_or_init_setting;
use mintel_common::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

/// Everything the pipeline needs at startup
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub topology: PipelineTopology,
    /// Fallback wake-up of an idle worker when no enqueue notification arrives
    pub poll_interval: Duration,
    /// Cadence of delayed promotion, stall detection, retention GC and reconciliation
    pub maintenance_interval: Duration,
    pub heartbeat_interval: Duration,
    pub event_channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            topology: PipelineTopology::default(),
            poll_interval: Duration::from_millis(1000),
            maintenance_interval: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(10_000),
            event_channel_capacity: 1024,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn key(stage: Stage, field: &str) -> String {
    format!("stage.{}.{}", stage.as_str(), field)
}

/// Load one stage's policy, falling back to (and persisting) its defaults
pub async fn load_stage_policy(db: &SqlitePool, stage: Stage) -> Result<StagePolicy> {
    let defaults = StagePolicy::defaults_for(stage);

    let required =
        get_or_init_setting(db, &key(stage, "required"), defaults.requirement.is_required()).await?;
    let enabled = get_or_init_setting(db, &key(stage, "enabled"), defaults.enabled).await?;
    let concurrency = get_or_init_setting(db, &key(stage, "concurrency"), defaults.concurrency).await?;
    let max_attempts = get_or_init_setting(db, &key(stage, "max_attempts"), defaults.max_attempts).await?;
    let backoff_base_ms =
        get_or_init_setting(db, &key(stage, "backoff_base_ms"), millis(defaults.backoff.base)).await?;
    let backoff_cap_ms =
        get_or_init_setting(db, &key(stage, "backoff_cap_ms"), millis(defaults.backoff.cap)).await?;
    let timeout_ms = get_or_init_setting(db, &key(stage, "timeout_ms"), millis(defaults.timeout)).await?;
    let stall_timeout_ms =
        get_or_init_setting(db, &key(stage, "stall_timeout_ms"), millis(defaults.stall_timeout)).await?;
    let priority = get_or_init_setting(db, &key(stage, "priority"), defaults.priority).await?;

    let retention = defaults.retention;
    let keep_completed =
        get_or_init_setting(db, &key(stage, "keep_completed"), retention.keep_completed).await?;
    let completed_max_age_secs = get_or_init_setting(
        db,
        &key(stage, "completed_max_age_secs"),
        retention.completed_max_age.as_secs(),
    )
    .await?;
    let keep_failed = get_or_init_setting(db, &key(stage, "keep_failed"), retention.keep_failed).await?;
    let failed_max_age_secs = get_or_init_setting(
        db,
        &key(stage, "failed_max_age_secs"),
        retention.failed_max_age.as_secs(),
    )
    .await?;

    Ok(StagePolicy {
        requirement: if required {
            StageRequirement::Required
        } else {
            StageRequirement::Optional
        },
        enabled,
        concurrency: concurrency.max(1),
        max_attempts: max_attempts.max(1),
        backoff: BackoffPolicy::new(
            Duration::from_millis(backoff_base_ms),
            Duration::from_millis(backoff_cap_ms.max(backoff_base_ms)),
        ),
        timeout: Duration::from_millis(timeout_ms.max(1)),
        stall_timeout: Duration::from_millis(stall_timeout_ms.max(1)),
        priority,
        retention: RetentionPolicy {
            keep_completed,
            completed_max_age: Duration::from_secs(completed_max_age_secs),
            keep_failed,
            failed_max_age: Duration::from_secs(failed_max_age_secs),
        },
    })
}

/// A healthy worker must get at least two heartbeats in before its task counts as stalled
fn clamp_stall_timeout(stage: Stage, mut policy: StagePolicy, heartbeat_interval: Duration) -> StagePolicy {
    let floor = heartbeat_interval.saturating_mul(2);
    if policy.stall_timeout < floor {
        warn!(
            stage = %stage,
            stall_timeout_ms = millis(policy.stall_timeout),
            heartbeat_interval_ms = millis(heartbeat_interval),
            "Stall timeout shorter than two heartbeats, raising it"
        );
        policy.stall_timeout = floor;
    }
    policy
}

impl PipelineSettings {
    /// Read the pipeline configuration from the `settings` table
    pub async fn load(db: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();

        let poll_interval_ms =
            get_or_init_setting(db, "pipeline.poll_interval_ms", millis(defaults.poll_interval)).await?;
        let maintenance_interval_ms = get_or_init_setting(
            db,
            "pipeline.maintenance_interval_ms",
            millis(defaults.maintenance_interval),
        )
        .await?;
        let heartbeat_interval_ms = get_or_init_setting(
            db,
            "pipeline.heartbeat_interval_ms",
            millis(defaults.heartbeat_interval),
        )
        .await?;
        let heartbeat_interval = Duration::from_millis(heartbeat_interval_ms.max(1));

        let mut policies = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let policy = load_stage_policy(db, stage).await?;
            policies.push((stage, clamp_stall_timeout(stage, policy, heartbeat_interval)));
        }

        let topology = PipelineTopology::from_policies(|stage| {
            policies
                .iter()
                .find(|(s, _)| *s == stage)
                .map(|(_, policy)| policy.clone())
                .unwrap_or_else(|| StagePolicy::defaults_for(stage))
        });

        let settings = Self {
            topology,
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            maintenance_interval: Duration::from_millis(maintenance_interval_ms.max(1)),
            heartbeat_interval,
            event_channel_capacity: defaults.event_channel_capacity,
        };

        info!(
            fan_out = ?settings.topology.fan_out(),
            required_fan_out = settings.topology.required_fan_out_count(),
            "Pipeline configuration loaded"
        );

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_tables;
    use mintel_common::db::{get_setting, init_memory_database, set_setting};

    async fn setup() -> SqlitePool {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_defaults_written_back() {
        let pool = setup().await;

        let settings = PipelineSettings::load(&pool).await.unwrap();
        assert_eq!(settings.topology, PipelineTopology::default());

        let required: Option<bool> = get_setting(&pool, "stage.follow_up_detection.required").await.unwrap();
        assert_eq!(required, Some(false));
        let enabled: Option<bool> = get_setting(&pool, "stage.timeline.enabled").await.unwrap();
        assert_eq!(enabled, Some(false));
        let poll: Option<u64> = get_setting(&pool, "pipeline.poll_interval_ms").await.unwrap();
        assert_eq!(poll, Some(1000));
    }

    #[tokio::test]
    async fn test_overrides_change_topology() {
        let pool = setup().await;
        set_setting(&pool, "stage.timeline.enabled", true).await.unwrap();
        set_setting(&pool, "stage.sentiment.required", false).await.unwrap();
        set_setting(&pool, "stage.extraction.max_attempts", 5u32).await.unwrap();

        let settings = PipelineSettings::load(&pool).await.unwrap();
        let topology = &settings.topology;

        assert_eq!(
            topology.fan_out(),
            &[Stage::Extraction, Stage::Sentiment, Stage::FollowUpDetection, Stage::Timeline]
        );
        assert!(!topology.is_required(Stage::Sentiment));
        assert_eq!(topology.required_fan_out_count(), 1);
        assert_eq!(topology.policy(Stage::Extraction).max_attempts, 5);
    }

    #[tokio::test]
    async fn test_entry_stage_cannot_be_made_optional() {
        let pool = setup().await;
        set_setting(&pool, "stage.transcription.required", false).await.unwrap();
        set_setting(&pool, "stage.transcription.enabled", false).await.unwrap();

        let settings = PipelineSettings::load(&pool).await.unwrap();
        assert!(settings.topology.is_required(Stage::Transcription));
        assert!(settings.topology.policy(Stage::Transcription).enabled);
    }

    #[tokio::test]
    async fn test_stall_timeout_raised_above_heartbeat() {
        let pool = setup().await;
        set_setting(&pool, "pipeline.heartbeat_interval_ms", 10_000u64).await.unwrap();
        set_setting(&pool, "stage.sentiment.stall_timeout_ms", 5_000u64).await.unwrap();
        set_setting(&pool, "stage.extraction.stall_timeout_ms", 45_000u64).await.unwrap();

        let settings = PipelineSettings::load(&pool).await.unwrap();
        let topology = &settings.topology;

        assert_eq!(topology.policy(Stage::Sentiment).stall_timeout, Duration::from_secs(20));
        assert_eq!(topology.policy(Stage::Extraction).stall_timeout, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = setup().await;
        set_setting(&pool, "stage.extraction.concurrency", "lots").await.unwrap();

        let err = PipelineSettings::load(&pool).await.unwrap_err();
        assert!(matches!(err, mintel_common::Error::Config(_)));
    }
}
