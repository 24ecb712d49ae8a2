//! Key/value settings table helpers

use crate::{Error, Result};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;

/// Read and parse a setting; `None` if the key is absent
pub async fn get_setting<T>(db: &SqlitePool, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Insert or overwrite a setting
pub async fn set_setting<T>(db: &SqlitePool, key: &str, value: T) -> Result<()>
where
    T: Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

/// Read a setting, writing `default` back when the key is missing
///
/// Persisting the default makes the effective value visible to operators.
pub async fn get_or_init_setting<T>(db: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match get_setting::<T>(db, key).await? {
        Some(value) => Ok(value),
        None => {
            set_setting(db, key, &default).await?;
            tracing::debug!(key, value = %default, "Initialized setting with default");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_get_missing_setting() {
        let pool = init_memory_database().await.unwrap();
        let value: Option<u32> = get_setting(&pool, "nope").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_then_get_overwrites() {
        let pool = init_memory_database().await.unwrap();

        set_setting(&pool, "stage.sentiment.concurrency", 3).await.unwrap();
        set_setting(&pool, "stage.sentiment.concurrency", 5).await.unwrap();

        let value: Option<u32> = get_setting(&pool, "stage.sentiment.concurrency")
            .await
            .unwrap();
        assert_eq!(value, Some(5));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = init_memory_database().await.unwrap();
        set_setting(&pool, "port", "not-a-number").await.unwrap();

        let err = get_setting::<u16>(&pool, "port").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_get_or_init_writes_default_once() {
        let pool = init_memory_database().await.unwrap();

        let first = get_or_init_setting(&pool, "pipeline.poll_interval_ms", 250u64)
            .await
            .unwrap();
        assert_eq!(first, 250);

        set_setting(&pool, "pipeline.poll_interval_ms", 100u64).await.unwrap();
        let second = get_or_init_setting(&pool, "pipeline.poll_interval_ms", 250u64)
            .await
            .unwrap();
        assert_eq!(second, 100);
    }
}
