//! Audit action log: append-only record of control actions and gate
//! outcomes.
//!
//! Writes are best-effort from the caller's point of view but never
//! swallowed silently: a failed write is surfaced through the alert
//! notifier, which rate-limits repeated warnings per event name. The log's
//! monotone insertion order (`seq`) is the stable order the audit
//! attestation ledger reads in.

// SQLite returns i64 for rowids and counts; they are always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use clawee_core::time::Clock;
use rusqlite::{Connection, params};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS audit_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at INTEGER NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    subject TEXT NOT NULL,
    detail TEXT NOT NULL
);
";

/// Default rate-limit window of the alert notifier.
pub const DEFAULT_ALERT_WINDOW: Duration = Duration::from_secs(60);

/// Errors produced by the audit log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Database error from `SQLite`.
    #[error("audit log database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored detail column could not be decoded.
    #[error("audit record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// One audit action.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditAction {
    /// Monotone sequence number.
    pub seq: u64,
    /// When the action was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Who acted.
    pub actor: String,
    /// What happened, e.g. `pipeline.block` or `budget.resume`.
    pub action: String,
    /// What it happened to.
    pub subject: String,
    /// Structured detail.
    pub detail: Value,
}

/// Rate-limited warning emitter for best-effort write failures.
///
/// At most one warning per event name per window; suppressed repeats are
/// counted and reported when the window reopens.
pub struct AlertNotifier {
    window: Duration,
    clock: Arc<dyn Clock>,
    last_emitted: Mutex<HashMap<String, (DateTime<Utc>, u64)>>,
}

impl std::fmt::Debug for AlertNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertNotifier")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl AlertNotifier {
    /// Creates a notifier with the given rate-limit window.
    #[must_use]
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Emits a warning for an event, unless one fired within the window.
    ///
    /// Returns `true` when the warning was actually emitted.
    pub fn alert(&self, event: &str, detail: &str) -> bool {
        let now = self.clock.now();
        let mut last = self.last_emitted.lock().expect("notifier lock poisoned");
        match last.get_mut(event) {
            Some((emitted_at, suppressed)) => {
                let age = (now - *emitted_at).to_std().unwrap_or_default();
                if age < self.window {
                    *suppressed += 1;
                    return false;
                }
                let skipped = *suppressed;
                *emitted_at = now;
                *suppressed = 0;
                warn!(%event, %detail, suppressed = skipped, "audit alert");
            }
            None => {
                last.insert(event.to_string(), (now, 0));
                warn!(%event, %detail, "audit alert");
            }
        }
        true
    }
}

/// `SQLite`-backed audit action log.
pub struct AuditLog {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    notifier: AlertNotifier,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Opens (or creates) the log at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self::assemble(conn, clock))
    }

    /// Opens an in-memory log, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self::assemble(conn, clock))
    }

    fn assemble(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        let notifier = AlertNotifier::new(DEFAULT_ALERT_WINDOW, Arc::clone(&clock));
        Self {
            conn: Mutex::new(conn),
            clock,
            notifier,
        }
    }

    /// Appends one action and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn record(
        &self,
        actor: &str,
        action: &str,
        subject: &str,
        detail: Value,
    ) -> Result<u64, AuditError> {
        let conn = self.conn.lock().expect("audit log lock poisoned");
        conn.execute(
            "INSERT INTO audit_actions (recorded_at, actor, action, subject, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.clock.now().timestamp_millis(),
                actor,
                action,
                subject,
                serde_json::to_string(&detail)?,
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Appends one action, routing failures through the alert notifier
    /// instead of the caller. The caller's decision never fails on an audit
    /// write.
    pub fn record_best_effort(&self, actor: &str, action: &str, subject: &str, detail: Value) {
        if let Err(err) = self.record(actor, action, subject, detail) {
            self.notifier.alert(action, &err.to_string());
        }
    }

    /// Reads actions with `seq > since`, in insertion order, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn read_since(&self, since: u64, limit: u32) -> Result<Vec<AuditAction>, AuditError> {
        let conn = self.conn.lock().expect("audit log lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq, recorded_at, actor, action, subject, detail
             FROM audit_actions WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let actions = stmt
            .query_map(params![since as i64, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        actions
            .into_iter()
            .map(|(seq, recorded_at, actor, action, subject, detail)| {
                Ok(AuditAction {
                    seq: seq as u64,
                    recorded_at: Utc
                        .timestamp_millis_opt(recorded_at)
                        .single()
                        .unwrap_or_else(Utc::now),
                    actor,
                    action,
                    subject,
                    detail: serde_json::from_str(&detail)?,
                })
            })
            .collect()
    }

    /// Returns the number of recorded actions.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn len(&self) -> Result<u64, AuditError> {
        let conn = self.conn.lock().expect("audit log lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_actions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Returns `true` when no actions have been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use clawee_core::time::ManualClock;

    use super::*;

    fn log() -> (AuditLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_wall_clock());
        let log = AuditLog::open_in_memory(Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
        (log, clock)
    }

    #[test]
    fn test_record_and_read_in_insertion_order() {
        let (log, _clock) = log();
        log.record("system", "pipeline.block", "/v1/messages", serde_json::json!({"gate": "policy"}))
            .unwrap();
        log.record("operator-1", "budget.resume", "budget", serde_json::json!({}))
            .unwrap();

        let actions = log.read_since(0, 10).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].seq < actions[1].seq);
        assert_eq!(actions[0].action, "pipeline.block");
    }

    #[test]
    fn test_read_since_cursor() {
        let (log, _clock) = log();
        let first = log
            .record("system", "a", "s", serde_json::json!({}))
            .unwrap();
        log.record("system", "b", "s", serde_json::json!({}))
            .unwrap();

        let actions = log.read_since(first, 10).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "b");
    }

    #[test]
    fn test_alert_notifier_rate_limits_per_event() {
        let clock = Arc::new(ManualClock::at_wall_clock());
        let notifier =
            AlertNotifier::new(Duration::from_secs(60), Arc::clone(&clock) as Arc<dyn Clock>);

        assert!(notifier.alert("audit.write", "disk full"));
        assert!(!notifier.alert("audit.write", "disk full"));
        // A different event name has its own window.
        assert!(notifier.alert("audit.read", "disk full"));

        clock.advance(Duration::from_secs(61));
        assert!(notifier.alert("audit.write", "disk full"));
    }
}
