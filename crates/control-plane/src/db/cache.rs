//! PostgreSQL-backed cache with TTLs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use execustack_tasks::stack::Cache;
use execustack_tasks::StackError;

use super::{stack_error, DbPool};

/// Cache over the `es_cache` table. Expired rows read as missing.
#[derive(Clone)]
pub struct PgCache {
    pool: DbPool,
}

impl PgCache {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Absolute expiry for an optional TTL.
pub fn expires_at(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl)
}

#[async_trait]
impl Cache for PgCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StackError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM es_cache WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(stack_error(StackError::Cache))?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StackError> {
        sqlx::query(
            r#"
            INSERT INTO es_cache (key, value, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at(ttl))
        .execute(&self.pool)
        .await
        .map_err(stack_error(StackError::Cache))?;
        Ok(())
    }

    async fn decr(&self, key: &str) -> Result<i64, StackError> {
        let (value,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO es_cache (key, value, expires_at) VALUES ($1, '-1', NULL)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN es_cache.expires_at IS NOT NULL AND es_cache.expires_at <= NOW() THEN '-1'
                    ELSE (es_cache.value::BIGINT - 1)::TEXT
                END,
                expires_at = CASE
                    WHEN es_cache.expires_at IS NOT NULL AND es_cache.expires_at <= NOW() THEN NULL
                    ELSE es_cache.expires_at
                END
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(stack_error(StackError::Cache))?;

        value
            .parse()
            .map_err(|_| StackError::Cache(format!("value at {} is not an integer", key)))
    }

    async fn del(&self, key: &str) -> Result<bool, StackError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "DELETE FROM es_cache WHERE key = $1 RETURNING (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(stack_error(StackError::Cache))?;
        Ok(row.map(|(live,)| live).unwrap_or(false))
    }
}
