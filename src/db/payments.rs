//! Payment CRUD operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ts_to_sql, NewPayment, Payment, PaymentStatus};
use super::unique_violation;
use crate::error::EntitlementError;

/// Get payment by ID
pub fn get_payment(conn: &Connection, id: i64) -> Result<Option<Payment>, EntitlementError> {
    conn.query_row("SELECT * FROM payments WHERE id = ?", params![id], Payment::from_row)
        .optional()
        .map_err(Into::into)
}

/// All payments for a user, newest first
pub fn list_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Payment>, EntitlementError> {
    let mut stmt =
        conn.prepare("SELECT * FROM payments WHERE user_id = ? ORDER BY created_at DESC, id DESC")?;
    let rows = stmt
        .query_map(params![user_id], Payment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Pending payments for a user, oldest first
pub fn list_pending_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Payment>, EntitlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM payments WHERE user_id = ? AND status = 'pending' ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![user_id], Payment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert a payment intent in PENDING state
pub fn insert_payment(
    conn: &Connection,
    input: &NewPayment,
    now: DateTime<Utc>,
) -> Result<Payment, EntitlementError> {
    let now = ts_to_sql(&now);
    conn.execute(
        "INSERT INTO payments (user_id, plan_id, amount, currency, status, provider, network,
                               wallet_address, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            input.user_id,
            input.plan_id,
            input.amount,
            input.currency,
            PaymentStatus::Pending,
            input.provider,
            input.network,
            input.wallet_address,
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_payment(conn, id)?.ok_or_else(|| EntitlementError::Internal("Failed to retrieve created payment".into()))
}

/// Persist a status change, recording the transaction id when given.
///
/// A transaction id already attached to another payment is a `Conflict`.
pub fn update_status(
    conn: &Connection,
    id: i64,
    status: PaymentStatus,
    transaction_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), EntitlementError> {
    let updated = conn
        .execute(
            "UPDATE payments
             SET status = ?1, transaction_id = COALESCE(?2, transaction_id), updated_at = ?3
             WHERE id = ?4",
            params![status, transaction_id, ts_to_sql(&now), id],
        )
        .map_err(|e| match unique_violation(&e) {
            Some(_) => EntitlementError::Conflict(format!(
                "transaction id {} already recorded",
                transaction_id.unwrap_or_default()
            )),
            None => e.into(),
        })?;

    if updated == 0 {
        return Err(EntitlementError::not_found("Payment", id));
    }
    Ok(())
}

/// Attach the subscription a confirmed payment paid for
pub fn link_subscription(
    conn: &Connection,
    id: i64,
    subscription_id: i64,
    now: DateTime<Utc>,
) -> Result<(), EntitlementError> {
    conn.execute(
        "UPDATE payments SET subscription_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![subscription_id, ts_to_sql(&now), id],
    )?;
    Ok(())
}
