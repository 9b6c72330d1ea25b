//! Distributed lock seam used to keep reconciliation runs exclusive.
//!
//! A lock is a `(key, token)` pair with a TTL. Only the holder of the token
//! can release it, and an expired lock can be taken over, so a crashed run
//! cannot wedge the job forever.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rebound_core::{error::Result, storage::Storage};

/// Cross-process mutual exclusion with a TTL.
#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Tries to take `key` for `ttl`. Returns `false` if someone else holds
    /// an unexpired lock.
    async fn acquire(&self, key: &str, ttl: Duration, token: &str) -> Result<bool>;

    /// Releases `key` if `token` still holds it. Returns `false` when the
    /// lock had expired or belongs to another token.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Lock stored in the `distributed_locks` table.
pub struct PostgresLock {
    storage: Arc<Storage>,
}

impl PostgresLock {
    /// Creates a lock backed by `storage`.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DistributedLock for PostgresLock {
    async fn acquire(&self, key: &str, ttl: Duration, token: &str) -> Result<bool> {
        self.storage.locks.try_acquire(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.storage.locks.release(key, token).await
    }
}

pub mod mock {
    //! In-process lock for tests and single-instance deployments.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use rebound_core::{error::Result, Clock, CoreError, RealClock};
    use tokio::sync::Mutex;

    use super::DistributedLock;

    #[derive(Debug, Clone)]
    struct Holder {
        token: String,
        expires_at: Instant,
    }

    /// Lock table held in memory, honouring TTLs via an injected clock.
    #[derive(Debug)]
    pub struct InMemoryLock {
        clock: Arc<dyn Clock>,
        held: Mutex<HashMap<String, Holder>>,
        acquire_calls: AtomicU32,
        release_calls: AtomicU32,
        fail_acquire: Mutex<Option<String>>,
    }

    impl InMemoryLock {
        /// Creates an empty lock table on the real clock.
        pub fn new() -> Self {
            Self::with_clock(RealClock::shared())
        }

        /// Creates an empty lock table reading time from `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                held: Mutex::new(HashMap::new()),
                acquire_calls: AtomicU32::new(0),
                release_calls: AtomicU32::new(0),
                fail_acquire: Mutex::new(None),
            }
        }

        /// Marks `key` as held by `token` for `ttl`, as another instance would.
        pub async fn hold(&self, key: &str, token: &str, ttl: Duration) {
            let expires_at = self.clock.now() + ttl;
            self.held
                .lock()
                .await
                .insert(key.to_string(), Holder { token: token.to_string(), expires_at });
        }

        /// Token currently holding `key`, ignoring expired entries.
        pub async fn holder(&self, key: &str) -> Option<String> {
            let now = self.clock.now();
            self.held
                .lock()
                .await
                .get(key)
                .filter(|holder| holder.expires_at > now)
                .map(|holder| holder.token.clone())
        }

        /// Makes the next `acquire` fail with a database error.
        pub async fn inject_acquire_error(&self, message: impl Into<String>) {
            *self.fail_acquire.lock().await = Some(message.into());
        }

        /// Number of `acquire` calls observed.
        pub fn acquire_calls(&self) -> u32 {
            self.acquire_calls.load(Ordering::Acquire)
        }

        /// Number of `release` calls observed.
        pub fn release_calls(&self) -> u32 {
            self.release_calls.load(Ordering::Acquire)
        }
    }

    impl Default for InMemoryLock {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DistributedLock for InMemoryLock {
        async fn acquire(&self, key: &str, ttl: Duration, token: &str) -> Result<bool> {
            self.acquire_calls.fetch_add(1, Ordering::AcqRel);
            if let Some(message) = self.fail_acquire.lock().await.take() {
                return Err(CoreError::Database(message));
            }

            let now = self.clock.now();
            let mut held = self.held.lock().await;
            if held.get(key).is_some_and(|holder| holder.expires_at > now) {
                return Ok(false);
            }

            held.insert(
                key.to_string(),
                Holder { token: token.to_string(), expires_at: now + ttl },
            );
            Ok(true)
        }

        async fn release(&self, key: &str, token: &str) -> Result<bool> {
            self.release_calls.fetch_add(1, Ordering::AcqRel);
            let mut held = self.held.lock().await;
            if held.get(key).is_some_and(|holder| holder.token == token) {
                held.remove(key);
                return Ok(true);
            }
            Ok(false)
        }
    }
}
