//! Repository for TTL-bounded distributed locks.
//!
//! A lock is a row keyed by name holding the owner's token and an expiry.
//! Acquisition is a single upsert that only overwrites an expired row, so it
//! is atomic across processes. Release deletes the row only when the token
//! matches, which keeps a late release from an earlier run from dropping a
//! lock someone else now holds.

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;

use crate::error::Result;

/// Repository for `distributed_locks`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Tries to take `key` for `ttl` on behalf of `token`.
    ///
    /// Returns `true` when the lock was free or its previous holder's TTL
    /// had expired.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO distributed_locks (lock_key, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
                SET token = EXCLUDED.token,
                    expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at <= NOW()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    /// Releases `key` if it is still held by `token`.
    ///
    /// Returns `false` when the lock had expired and been taken over, or was
    /// never held.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns the token currently holding `key`, ignoring expired rows.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn holder(&self, key: &str) -> Result<Option<String>> {
        let token = sqlx::query_scalar(
            "SELECT token FROM distributed_locks WHERE lock_key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(token)
    }
}
