//! Budget controller: projected and actual USD cost accounting with
//! automatic suspension.
//!
//! # Windows
//!
//! The hourly window is the rolling 60 minutes ending at now; the daily
//! window runs from the start of the current UTC day. Crossing either cap
//! suspends the budget with a reason embedding the offending values.
//!
//! # Suspension
//!
//! Suspension is monotone in the forward direction: only an explicit
//! operator resume with an actor identity clears it. Projected and actual
//! checks that cross a cap race to set suspension through the single-writer
//! store; the first write wins and later reasons do not overwrite it.

// SQLite stores token counts as i64; real values stay far below the wrap
// point. Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use clawee_core::catalog::{CatalogHandle, PricingTable};
use clawee_core::time::Clock;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::warn;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// USD caps per window. `None` means the window is uncapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetCaps {
    /// Cap on the rolling 60-minute window.
    pub hourly_usd: Option<f64>,
    /// Cap on the UTC day-to-date window.
    pub daily_usd: Option<f64>,
}

/// Errors produced by the budget controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BudgetError {
    /// Database error from `SQLite`.
    #[error("budget store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The budget is suspended; the request must be blocked.
    #[error("budget suspended: {reason}")]
    Suspended {
        /// The stored suspension reason.
        reason: String,
    },

    /// The request's model cannot be priced; evaluation fails closed.
    #[error(transparent)]
    Unpriced(#[from] clawee_core::catalog::UnpricedModel),
}

/// Current suspension state, as stored.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetStateRow {
    /// Whether the budget is suspended.
    pub suspended: bool,
    /// Why, when suspended.
    pub reason: Option<String>,
    /// When suspension was triggered.
    pub triggered_at: Option<DateTime<Utc>>,
    /// When the budget was last resumed.
    pub resumed_at: Option<DateTime<Utc>>,
    /// Who resumed it.
    pub resumed_by: Option<String>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of recording an actual cost event.
#[derive(Debug, Clone, Copy)]
pub struct RecordedCost {
    /// The USD cost recorded.
    pub usd_cost: f64,
    /// Whether the record pushed a window over its cap and suspended the
    /// budget.
    pub suspended: bool,
}

/// The budget controller.
pub struct BudgetController {
    conn: Mutex<Connection>,
    caps: BudgetCaps,
    pricing: Arc<CatalogHandle<PricingTable>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BudgetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetController")
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl BudgetController {
    /// Opens (or creates) the budget store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(
        path: &Path,
        caps: BudgetCaps,
        pricing: Arc<CatalogHandle<PricingTable>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BudgetError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, caps, pricing, clock)
    }

    /// Opens an in-memory controller, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory(
        caps: BudgetCaps,
        pricing: Arc<CatalogHandle<PricingTable>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BudgetError> {
        Self::init(Connection::open_in_memory()?, caps, pricing, clock)
    }

    fn init(
        conn: Connection,
        caps: BudgetCaps,
        pricing: Arc<CatalogHandle<PricingTable>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BudgetError> {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR IGNORE INTO budget_state (id, suspended, updated_at) VALUES (1, 0, ?1)",
            params![clock.now().timestamp_millis()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            caps,
            pricing,
            clock,
        })
    }

    /// Checks a projected request cost against the caps.
    ///
    /// Estimates the cost from the pricing catalog and compares each window
    /// sum plus the projection against its cap. Crossing a cap suspends the
    /// budget and fails the check. Projected checks never record cost.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Suspended`] when already suspended or when the
    /// projection crosses a cap, and [`BudgetError::Unpriced`] when the
    /// model cannot be priced (fail closed).
    pub fn check_projected(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, BudgetError> {
        let projection =
            self.pricing
                .snapshot()
                .rules
                .estimate(model, input_tokens, output_tokens)?;

        let conn = self.conn.lock().expect("budget store lock poisoned");
        let now = self.clock.now();

        let state = Self::state_locked(&conn)?;
        if state.suspended {
            return Err(BudgetError::Suspended {
                reason: state.reason.unwrap_or_else(|| "budget suspended".to_string()),
            });
        }

        if let Some(reason) = self.cap_violation(&conn, now, projection)? {
            Self::suspend_locked(&conn, now, &reason)?;
            warn!(%reason, "budget suspended on projected cost");
            return Err(BudgetError::Suspended { reason });
        }
        Ok(projection)
    }

    /// Records an actual cost event and re-checks the caps.
    ///
    /// Recording happens even when it pushes a window over its cap; the
    /// overage suspends the budget for subsequent requests.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Unpriced`] when the model cannot be priced,
    /// or a database error.
    pub fn record_actual(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        request_path: &str,
    ) -> Result<RecordedCost, BudgetError> {
        let usd_cost =
            self.pricing
                .snapshot()
                .rules
                .estimate(model, input_tokens, output_tokens)?;

        let conn = self.conn.lock().expect("budget store lock poisoned");
        let now = self.clock.now();
        conn.execute(
            "INSERT INTO cost_events
                (recorded_at, model, input_tokens, output_tokens, usd_cost, request_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now.timestamp_millis(),
                model,
                input_tokens as i64,
                output_tokens as i64,
                usd_cost,
                request_path,
            ],
        )?;

        let mut suspended = false;
        if !Self::state_locked(&conn)?.suspended {
            if let Some(reason) = self.cap_violation(&conn, now, 0.0)? {
                Self::suspend_locked(&conn, now, &reason)?;
                warn!(%reason, "budget suspended on actual cost");
                suspended = true;
            }
        }
        Ok(RecordedCost {
            usd_cost,
            suspended,
        })
    }

    /// Clears suspension. Only an explicit operator call with an actor
    /// identity reaches this; the enclosing control layer audits the
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn resume(&self, actor: &str) -> Result<BudgetStateRow, BudgetError> {
        let conn = self.conn.lock().expect("budget store lock poisoned");
        let now = self.clock.now();
        conn.execute(
            "UPDATE budget_state
             SET suspended = 0, reason = NULL, resumed_at = ?1, resumed_by = ?2, updated_at = ?1
             WHERE id = 1",
            params![now.timestamp_millis(), actor],
        )?;
        Self::state_locked(&conn)
    }

    /// Returns the current suspension state.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn state(&self) -> Result<BudgetStateRow, BudgetError> {
        let conn = self.conn.lock().expect("budget store lock poisoned");
        Self::state_locked(&conn)
    }

    /// Deletes cost events older than the daily window; invoked by the
    /// maintenance task.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn prune_cost_events(&self) -> Result<u64, BudgetError> {
        let conn = self.conn.lock().expect("budget store lock poisoned");
        let day_start = start_of_utc_day(self.clock.now());
        let hour_start = self.clock.now() - chrono::Duration::hours(1);
        let cutoff = day_start.min(hour_start);
        let removed = conn.execute(
            "DELETE FROM cost_events WHERE recorded_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed as u64)
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn window_sum(
        conn: &Connection,
        since: DateTime<Utc>,
    ) -> Result<f64, BudgetError> {
        let sum: Option<f64> = conn.query_row(
            "SELECT SUM(usd_cost) FROM cost_events WHERE recorded_at >= ?1",
            params![since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0.0))
    }

    /// Returns the suspension reason if a window plus the projection
    /// crosses its cap.
    fn cap_violation(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
        projection: f64,
    ) -> Result<Option<String>, BudgetError> {
        if let Some(cap) = self.caps.hourly_usd {
            let sum = Self::window_sum(conn, now - chrono::Duration::hours(1))?;
            if sum + projection > cap {
                return Ok(Some(format!(
                    "hourly budget exceeded: {:.2} > {:.2}",
                    sum + projection,
                    cap
                )));
            }
        }
        if let Some(cap) = self.caps.daily_usd {
            let sum = Self::window_sum(conn, start_of_utc_day(now))?;
            if sum + projection > cap {
                return Ok(Some(format!(
                    "daily budget exceeded: {:.2} > {:.2}",
                    sum + projection,
                    cap
                )));
            }
        }
        Ok(None)
    }

    fn suspend_locked(
        conn: &Connection,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), BudgetError> {
        // First write wins: an already-suspended state keeps its reason.
        conn.execute(
            "UPDATE budget_state
             SET suspended = 1, reason = ?1, triggered_at = ?2, updated_at = ?2
             WHERE id = 1 AND suspended = 0",
            params![reason, now.timestamp_millis()],
        )?;
        Ok(())
    }

    fn state_locked(conn: &Connection) -> Result<BudgetStateRow, BudgetError> {
        conn.query_row(
            "SELECT suspended, reason, triggered_at, resumed_at, resumed_by, updated_at
             FROM budget_state WHERE id = 1",
            [],
            |row| {
                Ok(BudgetStateRow {
                    suspended: row.get::<_, i64>(0)? != 0,
                    reason: row.get(1)?,
                    triggered_at: row.get::<_, Option<i64>>(2)?.map(millis_to_datetime),
                    resumed_at: row.get::<_, Option<i64>>(3)?.map(millis_to_datetime),
                    resumed_by: row.get(4)?,
                    updated_at: millis_to_datetime(row.get(5)?),
                })
            },
        )
        .map_err(BudgetError::from)
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
