//! Subscription CRUD operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ts_to_sql, Subscription, SubscriptionStatus};
use super::unique_violation;
use crate::error::EntitlementError;

/// Input for inserting a subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_trial: bool,
}

/// Get subscription by ID
pub fn get_subscription(conn: &Connection, id: i64) -> Result<Option<Subscription>, EntitlementError> {
    conn.query_row(
        "SELECT * FROM subscriptions WHERE id = ?",
        params![id],
        Subscription::from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// The user's trial or active subscription, if any
pub fn find_active_or_trial(
    conn: &Connection,
    user_id: i64,
) -> Result<Option<Subscription>, EntitlementError> {
    conn.query_row(
        "SELECT * FROM subscriptions
         WHERE user_id = ? AND status IN ('trial', 'active')
         ORDER BY id DESC LIMIT 1",
        params![user_id],
        Subscription::from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Live subscriptions whose window ended before `now`, oldest first
pub fn find_past_end_date(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<Subscription>, EntitlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM subscriptions
         WHERE status IN ('trial', 'active') AND end_date < ?
         ORDER BY end_date, id",
    )?;
    let rows = stmt
        .query_map(params![ts_to_sql(&now)], Subscription::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All subscriptions for a user, newest first
pub fn list_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Subscription>, EntitlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM subscriptions WHERE user_id = ? ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![user_id], Subscription::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert a subscription.
///
/// The partial unique index on live subscriptions turns a second live row
/// for the same user into `AlreadySubscribed`.
pub fn insert_subscription(
    conn: &Connection,
    input: &NewSubscription,
    now: DateTime<Utc>,
) -> Result<Subscription, EntitlementError> {
    if input.end_date <= input.start_date {
        return Err(EntitlementError::InvalidInput(
            "subscription must end after it starts".into(),
        ));
    }

    let now = ts_to_sql(&now);
    conn.execute(
        "INSERT INTO subscriptions (user_id, plan_id, status, start_date, end_date, is_trial,
                                    created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            input.user_id,
            input.plan_id,
            input.status,
            ts_to_sql(&input.start_date),
            ts_to_sql(&input.end_date),
            input.is_trial,
            now,
        ],
    )
    .map_err(|e| match unique_violation(&e) {
        Some(_) => EntitlementError::AlreadySubscribed {
            user_id: input.user_id,
        },
        None => e.into(),
    })?;

    let id = conn.last_insert_rowid();
    get_subscription(conn, id)?
        .ok_or_else(|| EntitlementError::Internal("Failed to retrieve created subscription".into()))
}

/// Persist a status change decided by the state machine
pub fn update_status(
    conn: &Connection,
    id: i64,
    status: SubscriptionStatus,
    is_trial: bool,
    now: DateTime<Utc>,
) -> Result<Subscription, EntitlementError> {
    let user_id: i64 = conn
        .query_row("SELECT user_id FROM subscriptions WHERE id = ?", params![id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| EntitlementError::not_found("Subscription", id))?;

    conn.execute(
        "UPDATE subscriptions SET status = ?1, is_trial = ?2, updated_at = ?3 WHERE id = ?4",
        params![status, is_trial, ts_to_sql(&now), id],
    )
    .map_err(|e| match unique_violation(&e) {
        Some(_) => EntitlementError::AlreadySubscribed { user_id },
        None => e.into(),
    })?;

    get_subscription(conn, id)?
        .ok_or_else(|| EntitlementError::Internal("Failed to retrieve updated subscription".into()))
}
