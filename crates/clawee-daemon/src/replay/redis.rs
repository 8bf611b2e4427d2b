//! Remote cache replay backend over Redis.
//!
//! The whole contract maps onto one primitive: `SET key value NX PX ttl`.
//! Redis expires entries natively, so the periodic sweep is a no-op.

use std::time::Duration;

use redis::aio::ConnectionManager;

use super::{BoxFuture, ReplayBackend, ReplayError, ReplayNamespace};

/// Key prefix for replay entries.
const KEY_PREFIX: &str = "clawee:replay";

/// Redis-backed replay store.
#[derive(Clone)]
pub struct RedisReplayBackend {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisReplayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisReplayBackend").finish_non_exhaustive()
    }
}

impl RedisReplayBackend {
    /// Creates a backend over an established connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connects to a Redis URL.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] when the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self, ReplayError> {
        let client = redis::Client::open(url).map_err(to_unavailable)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(to_unavailable)?;
        Ok(Self::new(conn))
    }

    fn key(namespace: ReplayNamespace, key_hash: &str) -> String {
        format!("{KEY_PREFIX}:{}:{key_hash}", namespace.as_str())
    }
}

fn to_unavailable(err: redis::RedisError) -> ReplayError {
    ReplayError::Unavailable {
        detail: err.to_string(),
    }
}

impl ReplayBackend for RedisReplayBackend {
    fn register<'a>(
        &'a self,
        namespace: ReplayNamespace,
        key_hash: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, ReplayError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            // SET NX PX is the single set-if-absent-with-expiry primitive;
            // a nil reply means the key was already present.
            let reply: Option<String> = redis::cmd("SET")
                .arg(Self::key(namespace, key_hash))
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(to_unavailable)?;
            Ok(reply.is_some())
        })
    }

    fn sweep_expired(&self) -> BoxFuture<'_, Result<u64, ReplayError>> {
        // Redis expires keys natively.
        Box::pin(async move { Ok(0) })
    }
}
