//! Idempotent schema bootstrap for the reconciliation tables.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID PRIMARY KEY,
        provider TEXT NOT NULL,
        event_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        last_retried_at TIMESTAMPTZ,
        failure_reason TEXT,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        exhausted BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ,
        UNIQUE (provider, event_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_pending
    ON webhook_events (created_at ASC)
    WHERE processed = FALSE AND exhausted = FALSE AND deleted_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS distributed_locks (
        lock_key TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Runs every DDL statement; safe to call on each startup.
///
/// # Errors
///
/// Returns `CoreError::Database` if a statement fails.
pub async fn ensure(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
