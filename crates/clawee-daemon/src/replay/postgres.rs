//! Remote SQL replay backend over Postgres.
//!
//! Registration is `INSERT .. ON CONFLICT DO NOTHING RETURNING` over a
//! `(namespace, key_hash)` primary key; a returned row means the hash was
//! absent. A lapsed entry is deleted in the same statement batch so the
//! at-most-once window tracks the TTL exactly, and a full sweep runs on
//! one in every [`SWEEP_EVERY_WRITES`] writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clawee_core::time::Clock;
use sqlx::postgres::PgPool;

use super::{BoxFuture, ReplayBackend, ReplayError, ReplayNamespace};

/// A full expired-row sweep runs on one in this many writes.
pub const SWEEP_EVERY_WRITES: u64 = 64;

/// Schema DDL for the replay table, applied by [`PostgresReplayBackend::migrate`].
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS replay_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    seen_at BIGINT NOT NULL,
    expires_at BIGINT NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);
CREATE INDEX IF NOT EXISTS idx_replay_entries_expires ON replay_entries (expires_at);
";

/// Postgres-backed replay store.
pub struct PostgresReplayBackend {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl std::fmt::Debug for PostgresReplayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresReplayBackend")
            .finish_non_exhaustive()
    }
}

impl PostgresReplayBackend {
    /// Creates a backend over an established pool.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Applies the replay table schema.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] when the DDL cannot be applied.
    pub async fn migrate(&self) -> Result<(), ReplayError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(to_unavailable)?;
        Ok(())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn to_unavailable(err: sqlx::Error) -> ReplayError {
    ReplayError::Unavailable {
        detail: err.to_string(),
    }
}

impl ReplayBackend for PostgresReplayBackend {
    fn register<'a>(
        &'a self,
        namespace: ReplayNamespace,
        key_hash: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, ReplayError>> {
        Box::pin(async move {
            let now_ms = self.now_millis();
            let expires_ms = now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

            // Drop a lapsed entry for this key before inserting, so a hash
            // whose TTL elapsed registers again without waiting for the
            // periodic sweep.
            sqlx::query(
                "DELETE FROM replay_entries
                 WHERE namespace = $1 AND key_hash = $2 AND expires_at < $3",
            )
            .bind(namespace.as_str())
            .bind(key_hash)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(to_unavailable)?;

            let inserted = sqlx::query(
                "INSERT INTO replay_entries (namespace, key_hash, seen_at, expires_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (namespace, key_hash) DO NOTHING
                 RETURNING key_hash",
            )
            .bind(namespace.as_str())
            .bind(key_hash)
            .bind(now_ms)
            .bind(expires_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_unavailable)?;

            let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
            if writes % SWEEP_EVERY_WRITES == 0 {
                sqlx::query("DELETE FROM replay_entries WHERE expires_at < $1")
                    .bind(now_ms)
                    .execute(&self.pool)
                    .await
                    .map_err(to_unavailable)?;
            }

            Ok(inserted.is_some())
        })
    }

    fn sweep_expired(&self) -> BoxFuture<'_, Result<u64, ReplayError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM replay_entries WHERE expires_at < $1")
                .bind(self.now_millis())
                .execute(&self.pool)
                .await
                .map_err(to_unavailable)?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use clawee_core::time::ManualClock;

    use super::*;
    use crate::replay::ReplayStore;

    /// Connects to the database named by `CLAWEE_TEST_POSTGRES_URL`, or
    /// skips the test when the environment is absent.
    async fn store() -> Option<(ReplayStore, Arc<ManualClock>)> {
        let Ok(url) = std::env::var("CLAWEE_TEST_POSTGRES_URL") else {
            return None;
        };
        let pool = PgPool::connect(&url).await.expect("test database reachable");
        let clock = Arc::new(ManualClock::at_wall_clock());
        let backend = PostgresReplayBackend::new(pool, Arc::clone(&clock) as Arc<dyn Clock>);
        backend.migrate().await.unwrap();
        backend.sweep_expired().await.unwrap();
        Some((ReplayStore::new(Box::new(backend)), clock))
    }

    #[tokio::test]
    async fn test_nonce_registers_once_then_again_after_ttl() {
        let Some((store, clock)) = store().await else {
            return;
        };
        let hash = format!("pg-{}", uuid::Uuid::new_v4());

        assert!(store
            .register_nonce(&hash, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .register_nonce(&hash, Duration::from_secs(60))
            .await
            .unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(store
            .register_nonce(&hash, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let Some((store, clock)) = store().await else {
            return;
        };
        let hash = format!("pg-{}", uuid::Uuid::new_v4());

        store
            .register_event_key(&hash, Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(120));
        assert!(store.sweep_expired().await.unwrap() >= 1);
    }
}
