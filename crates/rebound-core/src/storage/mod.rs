//! PostgreSQL repositories for reconciliation state.
//!
//! All SQL touching the `webhook_events` and `distributed_locks` tables lives
//! in this module. Callers go through the repositories so the schema can
//! change without touching job logic.

use std::sync::Arc;

use sqlx::PgPool;

pub mod locks;
pub mod schema;
pub mod webhook_events;

use crate::error::Result;

/// Container for the repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Failed webhook rows and their retry bookkeeping.
    pub webhook_events: Arc<webhook_events::Repository>,

    /// TTL-bounded mutual exclusion keys.
    pub locks: Arc<locks::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates the repositories over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhook_events: Arc::new(webhook_events::Repository::new(pool.clone())),
            locks: Arc::new(locks::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared pool handle.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates the tables and indexes the repositories rely on.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        schema::ensure(&self.pool).await
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_over_lazy_pool() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/rebound_test").unwrap();
        let storage = Storage::new(pool);
        assert_eq!(Arc::strong_count(&storage.pool()), 4);
    }
}
