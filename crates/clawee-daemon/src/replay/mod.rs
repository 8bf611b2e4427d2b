//! Replay-protection store: at-most-once registration of nonces and event
//! keys across pluggable backends.
//!
//! Every backend presents one contract: `register(namespace, hash, ttl)`
//! returns `true` iff the hash was absent, so the caller may proceed, and
//! `false` on replay. Registration must be linearizable within a backend;
//! two concurrent registrations of the same hash yield exactly one `true`.
//! A backend that cannot reach its store fails closed with a distinct error
//! kind so operators can tell infrastructure failures from replays.
//!
//! # TTL floors
//!
//! Event keys clamp to a 60 second floor, nonces to 1 second. A requested
//! TTL below the floor is raised and a warning is emitted.

mod postgres;
mod redis;
mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub use postgres::PostgresReplayBackend;
pub use redis::RedisReplayBackend;
pub use sqlite::SqliteReplayBackend;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// TTL floor for nonce registrations.
pub const NONCE_TTL_FLOOR: Duration = Duration::from_secs(1);

/// TTL floor for event-key registrations.
pub const EVENT_KEY_TTL_FLOOR: Duration = Duration::from_secs(60);

/// Registration namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayNamespace {
    /// Single-request nonces.
    Nonce,
    /// Delivery event keys.
    EventKey,
}

impl ReplayNamespace {
    /// Returns the storage name of the namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nonce => "nonce",
            Self::EventKey => "event_key",
        }
    }
}

/// Errors produced by replay backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplayError {
    /// The backend is unreachable or failed; callers must fail closed.
    #[error("replay backend unavailable: {detail}")]
    Unavailable {
        /// The backend failure.
        detail: String,
    },
}

/// The register-if-absent contract implemented by every backend.
pub trait ReplayBackend: Send + Sync {
    /// Registers a hash in a namespace with a TTL.
    ///
    /// Returns `true` iff the hash was absent (the caller may proceed) and
    /// `false` on replay.
    fn register<'a>(
        &'a self,
        namespace: ReplayNamespace,
        key_hash: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, ReplayError>>;

    /// Removes expired rows. Backends that expire natively may no-op.
    fn sweep_expired(&self) -> BoxFuture<'_, Result<u64, ReplayError>>;
}

/// The replay store: TTL-floor policy over a pluggable backend.
pub struct ReplayStore {
    backend: Box<dyn ReplayBackend>,
}

impl std::fmt::Debug for ReplayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayStore").finish_non_exhaustive()
    }
}

impl ReplayStore {
    /// Creates a store over a backend.
    #[must_use]
    pub fn new(backend: Box<dyn ReplayBackend>) -> Self {
        Self { backend }
    }

    /// Registers a nonce. TTL floor: 1 second.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] when the backend fails; callers
    /// fail closed.
    pub async fn register_nonce(&self, hash: &str, ttl: Duration) -> Result<bool, ReplayError> {
        let ttl = clamp_ttl(ttl, NONCE_TTL_FLOOR, "nonce");
        self.backend
            .register(ReplayNamespace::Nonce, hash, ttl)
            .await
    }

    /// Registers an event key. TTL floor: 60 seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] when the backend fails; callers
    /// fail closed.
    pub async fn register_event_key(&self, hash: &str, ttl: Duration) -> Result<bool, ReplayError> {
        let ttl = clamp_ttl(ttl, EVENT_KEY_TTL_FLOOR, "event key");
        self.backend
            .register(ReplayNamespace::EventKey, hash, ttl)
            .await
    }

    /// Sweeps expired rows; invoked by the maintenance task.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Unavailable`] when the backend fails.
    pub async fn sweep_expired(&self) -> Result<u64, ReplayError> {
        self.backend.sweep_expired().await
    }
}

fn clamp_ttl(requested: Duration, floor: Duration, kind: &str) -> Duration {
    if requested < floor {
        warn!(
            requested_secs = requested.as_secs_f64(),
            floor_secs = floor.as_secs(),
            "{kind} TTL below floor, raising"
        );
        floor
    } else {
        requested
    }
}
