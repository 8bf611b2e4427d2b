//! `SQLite`-backed approval store.
//!
//! All writes serialize through one connection, which gives the
//! get-or-create and consume operations their single-writer atomicity.
//! Cross-process callers must share the same database file.

// SQLite returns i64 for counts; values here are small and non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use clawee_core::catalog::ApprovalRequirement;
use clawee_core::time::Clock;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default lifetime of a pending approval.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(3600);

/// Errors produced by the approval store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApprovalError {
    /// Database error from `SQLite`.
    #[error("approval store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored JSON column could not be decoded.
    #[error("approval record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// No record with the given id.
    #[error("approval '{id}' not found")]
    NotFound {
        /// The missing id.
        id: Uuid,
    },

    /// The record is no longer pending.
    #[error("approval '{id}' is {status}, not pending")]
    NotPending {
        /// The record id.
        id: Uuid,
        /// Its current status.
        status: ApprovalStatus,
    },
}

/// Lifecycle state of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Waiting for quorum.
    Pending,
    /// Quorum met; consumable until expiry or max uses.
    Approved,
    /// Denied by an authorized actor.
    Denied,
    /// Expired before resolution.
    Expired,
}

impl ApprovalStatus {
    /// Returns the lowercase name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One approval record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApprovalRecord {
    /// Record id.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; always after `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: ApprovalStatus,
    /// Distinct approving actors required.
    pub required_approvals: u32,
    /// Roles that must each be represented among approvers.
    pub required_roles: BTreeSet<String>,
    /// Actors that approved so far.
    pub approval_actors: BTreeSet<String>,
    /// Role asserted by each approving actor.
    pub approval_actor_roles: BTreeMap<String, String>,
    /// Consumption ceiling.
    pub max_uses: u32,
    /// Successful consumptions so far; never exceeds `max_uses`.
    pub use_count: u32,
    /// Last successful consumption.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Canonical hash of the request fields this approval covers.
    pub request_fingerprint: String,
    /// Why the approval was required.
    pub reason: String,
    /// Opaque caller metadata.
    pub metadata: Value,
    /// Actor that resolved the record.
    pub resolved_by: Option<String>,
    /// When the record was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    /// Returns `true` if the quorum and role coverage are both met.
    #[must_use]
    pub fn quorum_met(&self) -> bool {
        if (self.approval_actors.len() as u32) < self.required_approvals {
            return false;
        }
        let covered: BTreeSet<&str> = self
            .approval_actor_roles
            .values()
            .map(String::as_str)
            .collect();
        self.required_roles
            .iter()
            .all(|role| covered.contains(role.as_str()))
    }
}

/// Counts by status, for the control-status surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ApprovalCounts {
    /// Pending records.
    pub pending: u64,
    /// Approved records.
    pub approved: u64,
    /// Denied records.
    pub denied: u64,
    /// Expired records.
    pub expired: u64,
}

/// `SQLite`-backed approval store.
pub struct ApprovalStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ApprovalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalStore").finish_non_exhaustive()
    }
}

impl ApprovalStore {
    /// Opens (or creates) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, ApprovalError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Opens an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, ApprovalError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Gets the pending record for a request fingerprint, upgrading it to
    /// the merged requirement, or creates a new pending record.
    ///
    /// Upgrading is monotone in every field: `required_approvals` and
    /// `max_uses` take the max of old and requested, `required_roles` the
    /// union. Idempotent across concurrent requests for the same
    /// fingerprint: callers serialize through this store's single writer.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_or_create_pending(
        &self,
        fingerprint: &str,
        requirement: &ApprovalRequirement,
        ttl: Duration,
        max_uses: u32,
        reason: &str,
        metadata: Value,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        let now = self.clock.now();
        Self::expire_pending(&conn, now)?;

        let existing: Option<ApprovalRecord> = conn
            .query_row(
                "SELECT * FROM approvals
                 WHERE request_fingerprint = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                params![fingerprint],
                Self::row_to_record,
            )
            .optional()?;

        if let Some(record) = existing {
            let merged_approvals = record.required_approvals.max(requirement.required_approvals);
            let mut merged_roles = record.required_roles.clone();
            merged_roles.extend(requirement.required_roles.iter().cloned());
            let merged_max_uses = record.max_uses.max(max_uses);

            conn.execute(
                "UPDATE approvals
                 SET required_approvals = ?2, required_roles = ?3, max_uses = ?4
                 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    merged_approvals,
                    serde_json::to_string(&merged_roles)?,
                    merged_max_uses,
                ],
            )?;
            debug!(id = %record.id, "upgraded pending approval");
            return Self::get_locked(&conn, record.id);
        }

        let id = Uuid::new_v4();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(3600));
        conn.execute(
            "INSERT INTO approvals (
                id, created_at, expires_at, status,
                required_approvals, required_roles,
                approval_actors, approval_actor_roles,
                max_uses, use_count, request_fingerprint, reason, metadata
             ) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, '[]', '{}', ?6, 0, ?7, ?8, ?9)",
            params![
                id.to_string(),
                now.timestamp_millis(),
                expires_at.timestamp_millis(),
                requirement.required_approvals,
                serde_json::to_string(&requirement.required_roles)?,
                max_uses,
                fingerprint,
                reason,
                serde_json::to_string(&metadata)?,
            ],
        )?;
        debug!(%id, %fingerprint, "created pending approval");
        Self::get_locked(&conn, id)
    }

    /// Records one actor's approval.
    ///
    /// Accumulates the actor and role; transitions to `approved` when the
    /// quorum is met and every required role is covered. Approving twice
    /// with the same actor is idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotPending`] when the record has resolved or
    /// expired.
    pub fn approve(
        &self,
        id: Uuid,
        actor: &str,
        role: &str,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        let now = self.clock.now();
        Self::expire_pending(&conn, now)?;

        let record = Self::get_locked(&conn, id)?;
        if record.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending {
                id,
                status: record.status,
            });
        }

        let mut actors = record.approval_actors.clone();
        let mut actor_roles = record.approval_actor_roles.clone();
        actors.insert(actor.to_string());
        actor_roles.insert(actor.to_string(), role.to_lowercase());

        let updated = ApprovalRecord {
            approval_actors: actors.clone(),
            approval_actor_roles: actor_roles.clone(),
            ..record
        };

        if updated.quorum_met() {
            conn.execute(
                "UPDATE approvals
                 SET approval_actors = ?2, approval_actor_roles = ?3,
                     status = 'approved', resolved_by = ?4, resolved_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id.to_string(),
                    serde_json::to_string(&actors)?,
                    serde_json::to_string(&actor_roles)?,
                    actor,
                    now.timestamp_millis(),
                ],
            )?;
            debug!(%id, %actor, "approval quorum met");
        } else {
            conn.execute(
                "UPDATE approvals
                 SET approval_actors = ?2, approval_actor_roles = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id.to_string(),
                    serde_json::to_string(&actors)?,
                    serde_json::to_string(&actor_roles)?,
                ],
            )?;
        }
        Self::get_locked(&conn, id)
    }

    /// Denies a pending record.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotPending`] when the record has resolved or
    /// expired.
    pub fn deny(&self, id: Uuid, actor: &str) -> Result<ApprovalRecord, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        let now = self.clock.now();
        Self::expire_pending(&conn, now)?;

        let record = Self::get_locked(&conn, id)?;
        if record.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending {
                id,
                status: record.status,
            });
        }
        conn.execute(
            "UPDATE approvals
             SET status = 'denied', resolved_by = ?2, resolved_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), actor, now.timestamp_millis()],
        )?;
        Self::get_locked(&conn, id)
    }

    /// Returns one record by id, applying lazy expiry first.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] when no record has the id.
    pub fn get(&self, id: Uuid) -> Result<ApprovalRecord, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        Self::expire_pending(&conn, self.clock.now())?;
        Self::get_locked(&conn, id)
    }

    /// Finds a consumable approved record for a request fingerprint.
    ///
    /// A record qualifies if it is approved, unexpired, and has uses
    /// remaining.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_valid_approved(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        let now = self.clock.now();
        Self::expire_pending(&conn, now)?;
        conn.query_row(
            "SELECT * FROM approvals
             WHERE request_fingerprint = ?1 AND status = 'approved'
               AND expires_at >= ?2 AND use_count < max_uses
             ORDER BY created_at ASC, id ASC LIMIT 1",
            params![fingerprint, now.timestamp_millis()],
            Self::row_to_record,
        )
        .optional()
        .map_err(ApprovalError::from)
    }

    /// Consumes one use of an approved record.
    ///
    /// Atomic single-row conditional update: the use count advances if and
    /// only if the record is approved, covers the fingerprint, is unexpired,
    /// and has uses remaining. A rejected consume changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn consume_approved(&self, id: Uuid, fingerprint: &str) -> Result<bool, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        let now = self.clock.now();
        let changed = conn.execute(
            "UPDATE approvals
             SET use_count = use_count + 1, last_used_at = ?3
             WHERE id = ?1 AND status = 'approved' AND request_fingerprint = ?2
               AND expires_at >= ?3 AND use_count < max_uses",
            params![id.to_string(), fingerprint, now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Lists records in stable order (`created_at` ASC, id ASC).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list(
        &self,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        Self::expire_pending(&conn, self.clock.now())?;
        let since_ms = since.map_or(i64::MIN, |t| t.timestamp_millis());
        let mut stmt = conn.prepare(
            "SELECT * FROM approvals WHERE created_at >= ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![since_ms, limit], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Returns counts by status.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn counts(&self) -> Result<ApprovalCounts, ApprovalError> {
        let conn = self.conn.lock().expect("approval store lock poisoned");
        Self::expire_pending(&conn, self.clock.now())?;
        let mut counts = ApprovalCounts::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM approvals GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match status.as_str() {
                "pending" => counts.pending = count,
                "approved" => counts.approved = count,
                "denied" => counts.denied = count,
                "expired" => counts.expired = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    /// Lazy expiry: on every read, pending rows past their expiry flip to
    /// `expired`.
    fn expire_pending(conn: &Connection, now: DateTime<Utc>) -> Result<(), ApprovalError> {
        conn.execute(
            "UPDATE approvals SET status = 'expired'
             WHERE status = 'pending' AND expires_at < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(())
    }

    fn get_locked(conn: &Connection, id: Uuid) -> Result<ApprovalRecord, ApprovalError> {
        conn.query_row(
            "SELECT * FROM approvals WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_record,
        )
        .optional()?
        .ok_or(ApprovalError::NotFound { id })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> Result<ApprovalRecord, rusqlite::Error> {
        fn parse_json<T: serde::de::DeserializeOwned>(
            idx: &str,
            raw: String,
        ) -> Result<T, rusqlite::Error> {
            serde_json::from_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    format!("column {idx}: {err}").into(),
                )
            })
        }
        let id_raw: String = row.get("id")?;
        let id = Uuid::parse_str(&id_raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        let status_raw: String = row.get("status")?;
        let status = ApprovalStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown status '{status_raw}'").into(),
            )
        })?;
        Ok(ApprovalRecord {
            id,
            created_at: millis_to_datetime(row.get("created_at")?),
            expires_at: millis_to_datetime(row.get("expires_at")?),
            status,
            required_approvals: row.get("required_approvals")?,
            required_roles: parse_json("required_roles", row.get("required_roles")?)?,
            approval_actors: parse_json("approval_actors", row.get("approval_actors")?)?,
            approval_actor_roles: parse_json(
                "approval_actor_roles",
                row.get("approval_actor_roles")?,
            )?,
            max_uses: row.get("max_uses")?,
            use_count: row.get("use_count")?,
            last_used_at: row
                .get::<_, Option<i64>>("last_used_at")?
                .map(millis_to_datetime),
            request_fingerprint: row.get("request_fingerprint")?,
            reason: row.get("reason")?,
            metadata: parse_json("metadata", row.get("metadata")?)?,
            resolved_by: row.get("resolved_by")?,
            resolved_at: row
                .get::<_, Option<i64>>("resolved_at")?
                .map(millis_to_datetime),
        })
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
