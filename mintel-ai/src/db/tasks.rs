//! Stage task persistence
//!
//! Every state change is one conditional UPDATE guarded by the expected state
//! (and, for a claimed task, its lease), so concurrent callers cannot both win.
//! Timestamps are stored as epoch milliseconds.

use crate::models::{NewTask, QueueStats, Stage, Task, TaskState};
use mintel_common::{time, Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_uuid;

const TASK_COLUMNS: &str = "id, stage, work_item_id, run, payload, state, priority, attempts, \
     max_attempts, progress, result, failure_reason, cancel_requested, created_at, processed_at, \
     finished_at, available_at, heartbeat_at";

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let stage: String = row.try_get("stage")?;
    let work_item_id: String = row.try_get("work_item_id")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let result: Option<String> = row.try_get("result")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        stage: stage.parse()?,
        work_item_id: parse_uuid(&work_item_id)?,
        run: row.try_get("run")?,
        payload: serde_json::from_str(&payload)?,
        state: state.parse()?,
        priority: row.try_get("priority")?,
        attempts: row.try_get::<i64, _>("attempts")?.max(0) as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")?.max(0) as u32,
        progress: row.try_get::<i64, _>("progress")?.clamp(0, 100) as u8,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        failure_reason: row.try_get("failure_reason")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        created_at: time::from_millis(created_at)
            .ok_or_else(|| Error::Internal(format!("Invalid created_at: {}", created_at)))?,
        processed_at: row.try_get::<Option<i64>, _>("processed_at")?.and_then(time::from_millis),
        finished_at: row.try_get::<Option<i64>, _>("finished_at")?.and_then(time::from_millis),
        available_at: row.try_get::<Option<i64>, _>("available_at")?.and_then(time::from_millis),
        heartbeat_at: row.try_get::<Option<i64>, _>("heartbeat_at")?.and_then(time::from_millis),
    })
}

/// Insert a Waiting task.
///
/// No-op (returns false) while a task with the same id exists, unless that task
/// is terminal and belongs to an earlier run, in which case it is replaced.
/// Also a no-op once the work item has moved past `run`.
pub async fn insert_task(pool: &SqlitePool, task: &NewTask, now: i64) -> Result<bool> {
    let payload = serde_json::to_string(&task.payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO stage_tasks (
            id, stage, work_item_id, run, payload, state, priority, seq,
            attempts, max_attempts, progress, created_at
        )
        SELECT
            ?1, ?2, ?3, ?4, ?5, 'waiting', ?6,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM stage_tasks),
            0, ?7, 0, ?8
        WHERE NOT EXISTS (SELECT 1 FROM work_items WHERE id = ?3 AND run > ?4)
        ON CONFLICT(id) DO UPDATE SET
            run = excluded.run,
            payload = excluded.payload,
            state = 'waiting',
            priority = excluded.priority,
            seq = excluded.seq,
            attempts = 0,
            max_attempts = excluded.max_attempts,
            progress = 0,
            result = NULL,
            failure_reason = NULL,
            cancel_requested = 0,
            lease = NULL,
            created_at = excluded.created_at,
            processed_at = NULL,
            finished_at = NULL,
            available_at = NULL,
            heartbeat_at = NULL
        WHERE stage_tasks.state IN ('completed', 'failed')
          AND excluded.run > stage_tasks.run
        "#,
    )
    .bind(task.id())
    .bind(task.stage.as_str())
    .bind(task.work_item_id.to_string())
    .bind(task.run)
    .bind(payload)
    .bind(task.priority)
    .bind(task.max_attempts as i64)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_task(pool: &SqlitePool, task_id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM stage_tasks WHERE id = ?", TASK_COLUMNS);
    let row = sqlx::query(&sql).bind(task_id).fetch_optional(pool).await?;
    row.as_ref().map(task_from_row).transpose()
}

/// Claim the next Waiting task of `stage` if fewer than `limit` are Active.
///
/// Highest priority (lowest value) first, then FIFO. Increments `attempts`.
pub async fn claim_next(
    pool: &SqlitePool,
    stage: Stage,
    limit: usize,
    lease: &str,
    now: i64,
) -> Result<Option<Task>> {
    let sql = format!(
        r#"
        UPDATE stage_tasks
        SET state = 'active',
            attempts = attempts + 1,
            processed_at = COALESCE(processed_at, ?3),
            heartbeat_at = ?3,
            lease = ?4,
            progress = 0
        WHERE id = (
            SELECT id FROM stage_tasks
            WHERE stage = ?1 AND state = 'waiting'
            ORDER BY priority ASC, seq ASC
            LIMIT 1
        )
        AND state = 'waiting'
        AND (SELECT COUNT(*) FROM stage_tasks WHERE stage = ?1 AND state = 'active') < ?2
        RETURNING {}
        "#,
        TASK_COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(stage.as_str())
        .bind(limit as i64)
        .bind(now)
        .bind(lease)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// Active -> Completed. Refused when the lease is stale or cancellation was requested.
pub async fn complete(
    pool: &SqlitePool,
    task_id: &str,
    lease: &str,
    result: &serde_json::Value,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_tasks
        SET state = 'completed', result = ?1, progress = 100, finished_at = ?2, lease = NULL
        WHERE id = ?3 AND state = 'active' AND lease = ?4 AND cancel_requested = 0
        "#,
    )
    .bind(serde_json::to_string(result)?)
    .bind(now)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Active -> Delayed, to become Waiting at `available_at`
pub async fn schedule_retry(
    pool: &SqlitePool,
    task_id: &str,
    lease: &str,
    reason: &str,
    available_at: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_tasks
        SET state = 'delayed', failure_reason = ?1, available_at = ?2,
            lease = NULL, heartbeat_at = NULL
        WHERE id = ?3 AND state = 'active' AND lease = ?4
          AND attempts < max_attempts AND cancel_requested = 0
        "#,
    )
    .bind(reason)
    .bind(available_at)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Active -> Failed (terminal)
pub async fn fail_terminal(
    pool: &SqlitePool,
    task_id: &str,
    lease: &str,
    reason: &str,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_tasks
        SET state = 'failed', failure_reason = ?1, finished_at = ?2, lease = NULL
        WHERE id = ?3 AND state = 'active' AND lease = ?4
        "#,
    )
    .bind(reason)
    .bind(now)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delayed -> Waiting for every task whose backoff has elapsed
pub async fn promote_due(pool: &SqlitePool, stage: Stage, now: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE stage_tasks
        SET state = 'waiting', available_at = NULL
        WHERE stage = ?1 AND state = 'delayed' AND available_at <= ?2
        "#,
    )
    .bind(stage.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn heartbeat(pool: &SqlitePool, task_id: &str, lease: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stage_tasks SET heartbeat_at = ?1 WHERE id = ?2 AND state = 'active' AND lease = ?3",
    )
    .bind(now)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Raise progress; never lowers it
pub async fn update_progress(pool: &SqlitePool, task_id: &str, lease: &str, percent: u8) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE stage_tasks SET progress = MAX(progress, ?1)
        WHERE id = ?2 AND state = 'active' AND lease = ?3
        "#,
    )
    .bind(percent.min(100) as i64)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a task that has not started (Waiting or Delayed)
pub async fn delete_pending(pool: &SqlitePool, task_id: &str) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM stage_tasks WHERE id = ? AND state IN ('waiting', 'delayed')")
            .bind(task_id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected() == 1)
}

/// Flag an Active task for cooperative cancellation
pub async fn request_cancel(pool: &SqlitePool, task_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stage_tasks SET cancel_requested = 1 WHERE id = ? AND state = 'active'",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn is_cancel_requested(pool: &SqlitePool, task_id: &str) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT cancel_requested FROM stage_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(pool)
            .await?;

    Ok(flag.unwrap_or(0) != 0)
}

/// Settle a cancel-flagged Active task as Failed("cancelled")
pub async fn finish_cancelled(pool: &SqlitePool, task_id: &str, lease: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_tasks
        SET state = 'failed', failure_reason = 'cancelled', finished_at = ?1, lease = NULL
        WHERE id = ?2 AND state = 'active' AND lease = ?3
        "#,
    )
    .bind(now)
    .bind(task_id)
    .bind(lease)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Outcome of one stall sweep
#[derive(Debug, Default)]
pub struct StallSweep {
    /// Demoted back to Waiting for another attempt
    pub requeued: Vec<String>,
    /// Out of attempts; now Failed
    pub exhausted: Vec<Task>,
    /// Cancel-flagged; settled as Failed("cancelled")
    pub cancelled: Vec<String>,
}

/// Recover Active tasks whose last heartbeat is older than `cutoff`
pub async fn sweep_stalled(pool: &SqlitePool, stage: Stage, cutoff: i64, now: i64) -> Result<StallSweep> {
    let cancelled: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE stage_tasks
        SET state = 'failed', failure_reason = 'cancelled', finished_at = ?3, lease = NULL
        WHERE stage = ?1 AND state = 'active' AND heartbeat_at < ?2 AND cancel_requested = 1
        RETURNING id
        "#,
    )
    .bind(stage.as_str())
    .bind(cutoff)
    .bind(now)
    .fetch_all(pool)
    .await?;

    let sql = format!(
        r#"
        UPDATE stage_tasks
        SET state = 'failed',
            failure_reason = 'stalled: no heartbeat, attempts exhausted',
            finished_at = ?3,
            lease = NULL
        WHERE stage = ?1 AND state = 'active' AND heartbeat_at < ?2 AND attempts >= max_attempts
        RETURNING {}
        "#,
        TASK_COLUMNS
    );
    let exhausted = sqlx::query(&sql)
        .bind(stage.as_str())
        .bind(cutoff)
        .bind(now)
        .fetch_all(pool)
        .await?
        .iter()
        .map(task_from_row)
        .collect::<Result<Vec<_>>>()?;

    let requeued: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE stage_tasks
        SET state = 'waiting', failure_reason = 'stalled: no heartbeat',
            lease = NULL, heartbeat_at = NULL
        WHERE stage = ?1 AND state = 'active' AND heartbeat_at < ?2
        RETURNING id
        "#,
    )
    .bind(stage.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(StallSweep {
        requeued,
        exhausted,
        cancelled,
    })
}

/// Delete finished tasks in `state` beyond the newest `keep`, or finished before `cutoff`
pub async fn prune_finished(
    pool: &SqlitePool,
    stage: Stage,
    state: TaskState,
    keep: u32,
    cutoff: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM stage_tasks
        WHERE stage = ?1 AND state = ?2 AND (
            COALESCE(finished_at, created_at) < ?3
            OR id NOT IN (
                SELECT id FROM stage_tasks
                WHERE stage = ?1 AND state = ?2
                ORDER BY COALESCE(finished_at, created_at) DESC, seq DESC
                LIMIT ?4
            )
        )
        "#,
    )
    .bind(stage.as_str())
    .bind(state.as_str())
    .bind(cutoff)
    .bind(keep as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn stats(pool: &SqlitePool, stage: Stage) -> Result<QueueStats> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM stage_tasks WHERE stage = ? GROUP BY state",
    )
    .bind(stage.as_str())
    .fetch_all(pool)
    .await?;

    let mut stats = QueueStats::default();
    for (state, count) in rows {
        stats.add(state.parse()?, count.max(0) as u64);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPayload;
    use uuid::Uuid;

    async fn setup() -> SqlitePool {
        let pool = mintel_common::db::init_memory_database().await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn new_task(stage: Stage, priority: i64) -> NewTask {
        let work_item_id = Uuid::new_v4();
        NewTask {
            stage,
            work_item_id,
            run: 1,
            payload: TaskPayload::Analysis {
                work_item_id,
                transcript_text: "hello".to_string(),
                participants: vec![],
                language_code: None,
            },
            priority,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_while_outstanding() {
        let pool = setup().await;
        let task = new_task(Stage::Extraction, 0);

        assert!(insert_task(&pool, &task, 1).await.unwrap());
        assert!(!insert_task(&pool, &task, 2).await.unwrap());

        let stored = get_task(&pool, &task.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Waiting);
        assert_eq!(stored.created_at.timestamp_millis(), 1);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let pool = setup().await;
        let low = new_task(Stage::Sentiment, 5);
        let first = new_task(Stage::Sentiment, 1);
        let second = new_task(Stage::Sentiment, 1);
        insert_task(&pool, &low, 1).await.unwrap();
        insert_task(&pool, &first, 2).await.unwrap();
        insert_task(&pool, &second, 3).await.unwrap();

        let mut order = Vec::new();
        for lease in ["a", "b", "c"] {
            let task = claim_next(&pool, Stage::Sentiment, 10, lease, 10).await.unwrap().unwrap();
            assert_eq!(task.attempts, 1);
            order.push(task.id);
        }
        assert_eq!(order, vec![first.id(), second.id(), low.id()]);
    }

    #[tokio::test]
    async fn test_claim_respects_concurrency_ceiling() {
        let pool = setup().await;
        insert_task(&pool, &new_task(Stage::Extraction, 0), 1).await.unwrap();
        insert_task(&pool, &new_task(Stage::Extraction, 0), 2).await.unwrap();

        assert!(claim_next(&pool, Stage::Extraction, 1, "a", 5).await.unwrap().is_some());
        assert!(claim_next(&pool, Stage::Extraction, 1, "b", 5).await.unwrap().is_none());
        assert!(claim_next(&pool, Stage::Extraction, 2, "b", 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_complete() {
        let pool = setup().await;
        let task = new_task(Stage::Extraction, 0);
        insert_task(&pool, &task, 1).await.unwrap();
        claim_next(&pool, Stage::Extraction, 1, "lease-1", 2).await.unwrap();

        let result = serde_json::json!({"ok": true});
        assert!(!complete(&pool, &task.id(), "other", &result, 3).await.unwrap());
        assert!(complete(&pool, &task.id(), "lease-1", &result, 3).await.unwrap());
        // Second completion does not land
        assert!(!complete(&pool, &task.id(), "lease-1", &result, 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let pool = setup().await;
        let task = new_task(Stage::Extraction, 0);
        insert_task(&pool, &task, 1).await.unwrap();
        claim_next(&pool, Stage::Extraction, 1, "l", 2).await.unwrap();

        update_progress(&pool, &task.id(), "l", 60).await.unwrap();
        update_progress(&pool, &task.id(), "l", 30).await.unwrap();

        let stored = get_task(&pool, &task.id()).await.unwrap().unwrap();
        assert_eq!(stored.progress, 60);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let pool = setup().await;
        let mut ids = Vec::new();
        for i in 0..4 {
            let task = new_task(Stage::Extraction, 0);
            insert_task(&pool, &task, i).await.unwrap();
            let lease = format!("l{}", i);
            claim_next(&pool, Stage::Extraction, 10, &lease, 10).await.unwrap();
            complete(&pool, &task.id(), &lease, &serde_json::json!({}), 100 + i).await.unwrap();
            ids.push(task.id());
        }

        let removed = prune_finished(&pool, Stage::Extraction, TaskState::Completed, 2, 0)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(get_task(&pool, &ids[0]).await.unwrap().is_none());
        assert!(get_task(&pool, &ids[3]).await.unwrap().is_some());
    }
}
