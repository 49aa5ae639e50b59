//! PostgreSQL-backed lease service.

use async_trait::async_trait;
use std::time::Duration;

use execustack_tasks::stack::{Lease, LockService};
use execustack_tasks::StackError;

use super::{stack_error, DbPool};

/// Leases over the `es_locks` table.
///
/// A row whose `expires_at` has passed is free to be taken over.
#[derive(Clone)]
pub struct PgLockService {
    pool: DbPool,
}

impl PgLockService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StackError> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO es_locks (key, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET
                token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE es_locks.expires_at <= NOW()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(stack_error(StackError::Lock))?;

        Ok(acquired.map(|(token,)| Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<(), StackError> {
        let result = sqlx::query(
            r#"
            UPDATE es_locks SET expires_at = NOW() + make_interval(secs => $3)
            WHERE key = $1 AND token = $2
            "#,
        )
        .bind(&lease.key)
        .bind(&lease.token)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(stack_error(StackError::Lock))?;

        if result.rows_affected() == 0 {
            return Err(StackError::Lock(format!("lease on {} is no longer held", lease.key)));
        }
        Ok(())
    }

    async fn release(&self, lease: &Lease) -> Result<(), StackError> {
        sqlx::query("DELETE FROM es_locks WHERE key = $1 AND token = $2")
            .bind(&lease.key)
            .bind(&lease.token)
            .execute(&self.pool)
            .await
            .map_err(stack_error(StackError::Lock))?;
        Ok(())
    }
}
