//! SQLite entitlement store
//!
//! Durable record of users, plans, subscriptions, payments and the referral
//! ledger. Every operation goes through [`EntitlementStore::with_conn`] or
//! [`EntitlementStore::with_tx`], which hold the single connection lock for
//! the whole closure, so a read-modify-write on one row can never interleave
//! with another.
//!
//! ## Tables
//!
//! - `users` - platform identity, referral code, trial flag
//! - `plans` - catalog entries
//! - `subscriptions` - entitlement windows (never deleted)
//! - `payments` - payment intents and their confirmation
//! - `referrals`, `referral_points` - referral ledger

pub mod models;
pub mod payments;
pub mod plans;
pub mod referrals;
pub mod schema;
pub mod subscriptions;
pub mod users;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::EntitlementError;

/// SQLite database for entitlement state
pub struct EntitlementStore {
    conn: Mutex<Connection>,
}

impl EntitlementStore {
    /// Open or create the database file
    pub fn open(db_path: &Path) -> Result<Self, EntitlementError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EntitlementError::Internal(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EntitlementError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| EntitlementError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, EntitlementError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            EntitlementError::Internal(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, EntitlementError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EntitlementError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EntitlementError> {
        self.conn
            .lock()
            .map_err(|e| EntitlementError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read-only operation
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EntitlementError>
    where
        F: FnOnce(&Connection) -> Result<T, EntitlementError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run an all-or-nothing write. The transaction commits only when `f`
    /// returns `Ok`; any error rolls every statement back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, EntitlementError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, EntitlementError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, EntitlementError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, EntitlementError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                users: count("SELECT COUNT(*) FROM users")?,
                plans: count("SELECT COUNT(*) FROM plans")?,
                live_subscriptions: count(
                    "SELECT COUNT(*) FROM subscriptions WHERE status IN ('trial', 'active')",
                )?,
                pending_payments: count("SELECT COUNT(*) FROM payments WHERE status = 'pending'")?,
                completed_payments: count(
                    "SELECT COUNT(*) FROM payments WHERE status = 'completed'",
                )?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub users: u64,
    pub plans: u64,
    pub live_subscriptions: u64,
    pub pending_payments: u64,
    pub completed_payments: u64,
}

/// If `err` is a UNIQUE violation, the offending `table.column` list.
pub(crate) fn unique_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) if e.code == ErrorCode::ConstraintViolation => {
            msg.strip_prefix("UNIQUE constraint failed: ")
        }
        _ => None,
    }
}

// Re-exports
pub use models::{
    Amount, NewPayment, NewPlan, Payment, PaymentStatus, PaymentTransition, Plan, PlanUpdate,
    Referral, ReferralPoint, Subscription, SubscriptionStatus, Transition, User, UserProfile,
};
