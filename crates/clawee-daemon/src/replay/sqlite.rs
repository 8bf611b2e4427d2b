//! Embedded `SQLite` replay backend.
//!
//! Single-writer upsert with `INSERT OR IGNORE`; expired rows are swept
//! opportunistically before each write so a lapsed hash can register again.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clawee_core::time::Clock;
use rusqlite::{Connection, params};

use super::{BoxFuture, ReplayBackend, ReplayError, ReplayNamespace};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS replay_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    seen_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);
CREATE INDEX IF NOT EXISTS idx_replay_expires ON replay_entries (expires_at);
";

/// `SQLite`-backed replay store.
pub struct SqliteReplayBackend {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteReplayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReplayBackend").finish_non_exhaustive()
    }
}

impl SqliteReplayBackend {
    /// Opens (or creates) the backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] if the database cannot be opened.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, ReplayError> {
        let conn = Connection::open(path).map_err(to_unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(to_unavailable)?;
        conn.execute_batch(SCHEMA_SQL).map_err(to_unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Opens an in-memory backend, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] if the database cannot be
    /// created.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, ReplayError> {
        let conn = Connection::open_in_memory().map_err(to_unavailable)?;
        conn.execute_batch(SCHEMA_SQL).map_err(to_unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn register_sync(
        &self,
        namespace: ReplayNamespace,
        key_hash: &str,
        ttl: Duration,
    ) -> Result<bool, ReplayError> {
        let conn = self.conn.lock().expect("replay store lock poisoned");
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        // Opportunistic sweep before each write.
        conn.execute(
            "DELETE FROM replay_entries WHERE expires_at < ?1",
            params![now_ms],
        )
        .map_err(to_unavailable)?;

        let expires_ms = now_ms + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO replay_entries (namespace, key_hash, seen_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![namespace.as_str(), key_hash, now_ms, expires_ms],
            )
            .map_err(to_unavailable)?;
        Ok(inserted == 1)
    }

    fn sweep_sync(&self) -> Result<u64, ReplayError> {
        let conn = self.conn.lock().expect("replay store lock poisoned");
        let removed = conn
            .execute(
                "DELETE FROM replay_entries WHERE expires_at < ?1",
                params![self.clock.now().timestamp_millis()],
            )
            .map_err(to_unavailable)?;
        Ok(removed as u64)
    }
}

fn to_unavailable(err: rusqlite::Error) -> ReplayError {
    ReplayError::Unavailable {
        detail: err.to_string(),
    }
}

impl ReplayBackend for SqliteReplayBackend {
    fn register<'a>(
        &'a self,
        namespace: ReplayNamespace,
        key_hash: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, ReplayError>> {
        Box::pin(async move { self.register_sync(namespace, key_hash, ttl) })
    }

    fn sweep_expired(&self) -> BoxFuture<'_, Result<u64, ReplayError>> {
        Box::pin(async move { self.sweep_sync() })
    }
}

#[cfg(test)]
mod tests {
    use clawee_core::time::ManualClock;

    use super::*;
    use crate::replay::ReplayStore;

    fn store() -> (ReplayStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_wall_clock());
        let backend =
            SqliteReplayBackend::open_in_memory(Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
        (ReplayStore::new(Box::new(backend)), clock)
    }

    #[tokio::test]
    async fn test_nonce_registers_once_within_ttl() {
        let (store, _clock) = store();
        assert!(store
            .register_nonce("a1b2", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .register_nonce("a1b2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_nonce_registers_again_after_ttl() {
        let (store, clock) = store();
        assert!(store
            .register_nonce("a1b2", Duration::from_secs(60))
            .await
            .unwrap());
        clock.advance(Duration::from_secs(61));
        assert!(store
            .register_nonce("a1b2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let (store, _clock) = store();
        assert!(store
            .register_nonce("same-hash", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store
            .register_event_key("same-hash", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_event_key_short_ttl_raised_to_floor() {
        let (store, clock) = store();
        assert!(store
            .register_event_key("ek-1", Duration::from_secs(5))
            .await
            .unwrap());
        // 5 seconds later the entry is still held by the 60 second floor.
        clock.advance(Duration::from_secs(6));
        assert!(!store
            .register_event_key("ek-1", Duration::from_secs(5))
            .await
            .unwrap());
        clock.advance(Duration::from_secs(55));
        assert!(store
            .register_event_key("ek-1", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let (store, clock) = store();
        store
            .register_nonce("n-1", Duration::from_secs(10))
            .await
            .unwrap();
        store
            .register_nonce("n-2", Duration::from_secs(120))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
    }
}
