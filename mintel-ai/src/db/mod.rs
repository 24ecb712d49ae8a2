//! Database access for mintel-ai
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS`; schema changes are
//! additive only, since other subsystems read `work_items` and `stage_outputs`.

pub mod tasks;
pub mod work_items;

use mintel_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open the shared database and create pipeline tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = mintel_common::db::init_database(db_path).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create pipeline tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_tasks (
            id TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            work_item_id TEXT NOT NULL,
            run INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            seq INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            result TEXT,
            failure_reason TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            lease TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            finished_at INTEGER,
            available_at INTEGER,
            heartbeat_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_tasks_claim ON stage_tasks (stage, state, priority, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_tasks_work_item ON stage_tasks (work_item_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL,
            source_locator TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            participants TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            run INTEGER NOT NULL DEFAULT 1,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            fan_out_remaining INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items (status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_outputs (
            work_item_id TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
            stage TEXT NOT NULL,
            output TEXT NOT NULL,
            cost REAL NOT NULL DEFAULT 0,
            written_at TEXT NOT NULL,
            PRIMARY KEY (work_item_id, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Fan-in bookkeeping: one row per stage completion counted in a run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_marks (
            work_item_id TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
            run INTEGER NOT NULL,
            stage TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            PRIMARY KEY (work_item_id, run, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (stage_tasks, work_items, stage_outputs, stage_marks)");

    Ok(())
}

/// Parse a UUID stored as TEXT
pub(crate) fn parse_uuid(value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| mintel_common::Error::Internal(format!("Invalid UUID '{}': {}", value, e)))
}
