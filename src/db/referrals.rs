//! Referral ledger operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ts_to_sql, Referral, ReferralPoint};
use crate::error::EntitlementError;

pub fn find_referral(
    conn: &Connection,
    referrer_id: i64,
    referred_id: i64,
) -> Result<Option<Referral>, EntitlementError> {
    conn.query_row(
        "SELECT * FROM referrals WHERE referrer_id = ? AND referred_id = ?",
        params![referrer_id, referred_id],
        Referral::from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Record a referral together with the referrer's points award
pub fn insert_referral(
    conn: &Connection,
    referrer_id: i64,
    referred_id: i64,
    points: i64,
    now: DateTime<Utc>,
) -> Result<Referral, EntitlementError> {
    let created_at = ts_to_sql(&now);
    conn.execute(
        "INSERT INTO referrals (referrer_id, referred_id, points_awarded, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![referrer_id, referred_id, points, created_at],
    )?;
    let referral_id = conn.last_insert_rowid();

    insert_points(
        conn,
        referrer_id,
        points,
        Some(&format!("Referral bonus for user {}", referred_id)),
        Some(referral_id),
        now,
    )?;

    find_referral(conn, referrer_id, referred_id)?
        .ok_or_else(|| EntitlementError::Internal("Failed to retrieve created referral".into()))
}

/// Append a points ledger entry
pub fn insert_points(
    conn: &Connection,
    user_id: i64,
    points: i64,
    description: Option<&str>,
    referral_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(), EntitlementError> {
    conn.execute(
        "INSERT INTO referral_points (user_id, points, description, referral_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user_id, points, description, referral_id, ts_to_sql(&now)],
    )?;
    Ok(())
}

pub fn count_referrals(conn: &Connection, referrer_id: i64) -> Result<i64, EntitlementError> {
    conn.query_row(
        "SELECT COUNT(*) FROM referrals WHERE referrer_id = ?",
        params![referrer_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn total_points(conn: &Connection, user_id: i64) -> Result<i64, EntitlementError> {
    conn.query_row(
        "SELECT COALESCE(SUM(points), 0) FROM referral_points WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Points history, newest first
pub fn points_history(conn: &Connection, user_id: i64) -> Result<Vec<ReferralPoint>, EntitlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM referral_points WHERE user_id = ? ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![user_id], ReferralPoint::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
