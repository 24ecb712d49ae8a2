//! Work-item persistence
//!
//! Status changes are compare-and-set updates over the set of allowed
//! predecessor states, so two near-simultaneous writers cannot both apply a
//! transition. `started_at`, `completed_at` and `error` are only ever filled
//! once per run (`COALESCE`).

use crate::models::{
    ProcessingMeta, Stage, StageOutput, StageOutputs, WorkItem, WorkItemStatus,
};
use chrono::{DateTime, Utc};
use mintel_common::{Error, Result};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Executor, Row, SqlitePool};
use uuid::Uuid;

use super::parse_uuid;

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Internal(format!("Invalid timestamp '{}': {}", v, e)))
        })
        .transpose()
}

fn work_item_from_row(row: &SqliteRow) -> Result<WorkItem> {
    let id: String = row.try_get("id")?;
    let participants: String = row.try_get("participants")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkItem {
        id: parse_uuid(&id)?,
        requester_id: row.try_get("requester_id")?,
        source_locator: row.try_get("source_locator")?,
        size_bytes: row.try_get("size_bytes")?,
        participants: serde_json::from_str(&participants)?,
        status: status.parse()?,
        run: row.try_get("run")?,
        processing_meta: ProcessingMeta {
            started_at: parse_timestamp(row.try_get("started_at")?)?,
            completed_at: parse_timestamp(row.try_get("completed_at")?)?,
            cost: row.try_get("cost")?,
            error: row.try_get("error")?,
        },
        outputs: StageOutputs::default(),
        fan_out_remaining: row.try_get("fan_out_remaining")?,
        created_at: parse_timestamp(Some(created_at))?.unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(Some(updated_at))?.unwrap_or_else(Utc::now),
    })
}

pub async fn insert_work_item(pool: &SqlitePool, item: &WorkItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO work_items (
            id, requester_id, source_locator, size_bytes, participants,
            status, run, fan_out_remaining, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(item.id.to_string())
    .bind(&item.requester_id)
    .bind(&item.source_locator)
    .bind(item.size_bytes)
    .bind(serde_json::to_string(&item.participants)?)
    .bind(item.status.as_str())
    .bind(item.run)
    .bind(item.fan_out_remaining)
    .bind(item.created_at.to_rfc3339())
    .bind(item.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a work item with its stage outputs and accumulated cost
pub async fn load_work_item(pool: &SqlitePool, id: Uuid) -> Result<Option<WorkItem>> {
    let row = sqlx::query(
        r#"
        SELECT w.*,
               COALESCE((SELECT SUM(cost) FROM stage_outputs o WHERE o.work_item_id = w.id), 0.0) AS cost
        FROM work_items w
        WHERE w.id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut item = work_item_from_row(&row)?;

    let outputs: Vec<(String,)> =
        sqlx::query_as("SELECT output FROM stage_outputs WHERE work_item_id = ?")
            .bind(id.to_string())
            .fetch_all(pool)
            .await?;

    for (output,) in outputs {
        item.outputs.set(serde_json::from_str::<StageOutput>(&output)?);
    }

    Ok(Some(item))
}

/// Current status and run of a work item
pub async fn load_status(pool: &SqlitePool, id: Uuid) -> Result<Option<(WorkItemStatus, i64)>> {
    let row: Option<(String, i64)> = sqlx::query_as("SELECT status, run FROM work_items WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|(status, run)| -> Result<_> { Ok((status.parse::<WorkItemStatus>()?, run)) })
        .transpose()
}

/// Ids and runs of every work item in one of `statuses`
pub async fn list_by_status(
    pool: &SqlitePool,
    statuses: &[WorkItemStatus],
) -> Result<Vec<(Uuid, WorkItemStatus, i64)>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT id, status, run FROM work_items WHERE status IN ({}) ORDER BY created_at",
        status_list(statuses)
    );
    let rows: Vec<(String, String, i64)> = sqlx::query_as(&sql).fetch_all(pool).await?;

    rows.into_iter()
        .map(|(id, status, run)| -> Result<_> { Ok((parse_uuid(&id)?, status.parse::<WorkItemStatus>()?, run)) })
        .collect()
}

/// Quoted SQL list of status literals (closed enum, never user input)
fn status_list(statuses: &[WorkItemStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compare-and-set a status transition.
///
/// Applies only if the current status is a legal predecessor of `to` and, when
/// `run` is given, the item is still on that run. Entering Processing sets
/// `started_at`, Completed sets `completed_at`, Failed records `error`; each at
/// most once.
pub async fn transition_status<'e, E>(
    executor: E,
    id: Uuid,
    run: Option<i64>,
    to: WorkItemStatus,
    error: Option<&str>,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let predecessors = WorkItemStatus::predecessors(to);
    if predecessors.is_empty() {
        return Ok(false);
    }

    let now = Utc::now().to_rfc3339();
    let started_at = matches!(to, WorkItemStatus::Processing | WorkItemStatus::Transcribed)
        .then(|| now.clone());
    let completed_at = matches!(to, WorkItemStatus::Completed).then(|| now.clone());
    let error = match to {
        WorkItemStatus::Failed => error.map(str::to_string),
        _ => None,
    };

    let sql = format!(
        r#"
        UPDATE work_items
        SET status = ?1,
            updated_at = ?2,
            started_at = COALESCE(started_at, ?3),
            completed_at = COALESCE(completed_at, ?4),
            error = COALESCE(error, ?5)
        WHERE id = ?6
          AND (?7 IS NULL OR run = ?7)
          AND status IN ({})
        "#,
        status_list(&predecessors)
    );

    let result = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(&now)
        .bind(started_at)
        .bind(completed_at)
        .bind(error)
        .bind(id.to_string())
        .bind(run)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Entry stage done: move to Transcribed and arm the fan-in counter in one statement
pub async fn begin_fan_out(pool: &SqlitePool, id: Uuid, run: i64, required: i64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE work_items
        SET status = 'transcribed',
            fan_out_remaining = ?1,
            started_at = COALESCE(started_at, ?2),
            updated_at = ?2
        WHERE id = ?3 AND run = ?4 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(required)
    .bind(&now)
    .bind(id.to_string())
    .bind(run)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Result of counting one fan-out stage completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanIn {
    /// This stage was already counted for this run
    Duplicate,
    /// Optional stage: marked, not counted
    Recorded,
    /// Counted; this many required stages remain
    Remaining(i64),
    /// Counted the last one and moved the item to Completed
    Completed,
    /// Item is not Transcribed on this run (cancelled, failed or resubmitted)
    NotApplicable,
}

/// Count a fan-out stage completion.
///
/// Mark insert, counter decrement and the final compare-and-set run in one
/// transaction. The mark makes a repeated completion a no-op instead of a
/// second decrement. Optional stages are marked but not counted.
pub async fn record_fan_in(
    pool: &SqlitePool,
    id: Uuid,
    run: i64,
    stage: Stage,
    counted: bool,
) -> Result<FanIn> {
    let mut tx = pool.begin().await?;
    let now = Utc::now().to_rfc3339();

    // Write first so the transaction takes the write lock up front
    let marked = sqlx::query(
        r#"
        INSERT INTO stage_marks (work_item_id, run, stage, marked_at)
        SELECT ?1, ?2, ?3, ?4
        WHERE EXISTS (SELECT 1 FROM work_items WHERE id = ?1 AND run = ?2)
        ON CONFLICT(work_item_id, run, stage) DO NOTHING
        "#,
    )
    .bind(id.to_string())
    .bind(run)
    .bind(stage.as_str())
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if !marked {
        tx.commit().await?;
        return Ok(FanIn::Duplicate);
    }

    if !counted {
        tx.commit().await?;
        return Ok(FanIn::Recorded);
    }

    let remaining: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE work_items
        SET fan_out_remaining = fan_out_remaining - 1, updated_at = ?1
        WHERE id = ?2 AND run = ?3 AND status = 'transcribed' AND fan_out_remaining > 0
        RETURNING fan_out_remaining
        "#,
    )
    .bind(&now)
    .bind(id.to_string())
    .bind(run)
    .fetch_optional(&mut *tx)
    .await?;

    let outcome = match remaining {
        None => FanIn::NotApplicable,
        Some(0) => {
            if transition_status(&mut *tx, id, Some(run), WorkItemStatus::Completed, None).await? {
                FanIn::Completed
            } else {
                FanIn::NotApplicable
            }
        }
        Some(n) => FanIn::Remaining(n),
    };

    tx.commit().await?;
    Ok(outcome)
}

pub async fn is_stage_marked(pool: &SqlitePool, id: Uuid, run: i64, stage: Stage) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM stage_marks WHERE work_item_id = ? AND run = ? AND stage = ?",
    )
    .bind(id.to_string())
    .bind(run)
    .bind(stage.as_str())
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Write a stage's output, replacing any earlier output of that stage.
///
/// Returns false (nothing written) if the item is no longer on `run`.
pub async fn save_stage_output(
    pool: &SqlitePool,
    id: Uuid,
    run: i64,
    output: &StageOutput,
    cost: f64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO stage_outputs (work_item_id, stage, output, cost, written_at)
        SELECT ?1, ?2, ?3, ?4, ?5
        WHERE EXISTS (SELECT 1 FROM work_items WHERE id = ?1 AND run = ?6)
        ON CONFLICT(work_item_id, stage) DO UPDATE SET
            output = excluded.output,
            cost = excluded.cost,
            written_at = excluded.written_at
        "#,
    )
    .bind(id.to_string())
    .bind(output.stage().as_str())
    .bind(serde_json::to_string(output)?)
    .bind(cost)
    .bind(Utc::now().to_rfc3339())
    .bind(run)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn load_stage_output(pool: &SqlitePool, id: Uuid, stage: Stage) -> Result<Option<StageOutput>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT output FROM stage_outputs WHERE work_item_id = ? AND stage = ?")
            .bind(id.to_string())
            .bind(stage.as_str())
            .fetch_optional(pool)
            .await?;

    row.map(|(output,)| serde_json::from_str(&output).map_err(Error::from))
        .transpose()
}

/// Start a new run: back to Scheduled with processing meta, outputs and marks cleared.
///
/// Returns the new run number, or None if the item's status is not one of `from`.
pub async fn reset_for_resubmission(
    pool: &SqlitePool,
    id: Uuid,
    from: &[WorkItemStatus],
) -> Result<Option<i64>> {
    if from.is_empty() {
        return Ok(None);
    }

    let mut tx = pool.begin().await?;

    let sql = format!(
        r#"
        UPDATE work_items
        SET status = 'scheduled',
            run = run + 1,
            started_at = NULL,
            completed_at = NULL,
            error = NULL,
            fan_out_remaining = 0,
            updated_at = ?1
        WHERE id = ?2 AND status IN ({})
        RETURNING run
        "#,
        status_list(from)
    );
    let run: Option<i64> = sqlx::query_scalar(&sql)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

    if run.is_some() {
        sqlx::query("DELETE FROM stage_outputs WHERE work_item_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM stage_marks WHERE work_item_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(run)
}
