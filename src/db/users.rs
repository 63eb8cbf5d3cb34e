//! User CRUD operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ts_to_sql, User, UserProfile};
use super::unique_violation;
use crate::error::EntitlementError;

/// Get user by internal id
pub fn get_user(conn: &Connection, id: i64) -> Result<Option<User>, EntitlementError> {
    conn.query_row("SELECT * FROM users WHERE id = ?", params![id], User::from_row)
        .optional()
        .map_err(Into::into)
}

/// Get user by messaging platform id
pub fn find_by_external_id(
    conn: &Connection,
    external_id: i64,
) -> Result<Option<User>, EntitlementError> {
    conn.query_row(
        "SELECT * FROM users WHERE external_id = ?",
        params![external_id],
        User::from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Get user by referral code
pub fn find_by_referral_code(
    conn: &Connection,
    referral_code: &str,
) -> Result<Option<User>, EntitlementError> {
    conn.query_row(
        "SELECT * FROM users WHERE referral_code = ?",
        params![referral_code],
        User::from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Insert a new user.
///
/// Fails with `Conflict` when `external_id` or `referral_code` is taken; the
/// message names the column so callers can retry with a fresh code.
pub fn insert_user(
    conn: &Connection,
    external_id: i64,
    profile: &UserProfile,
    referral_code: &str,
    now: DateTime<Utc>,
) -> Result<User, EntitlementError> {
    let now = ts_to_sql(&now);
    conn.execute(
        "INSERT INTO users (external_id, username, first_name, last_name, language_code,
                            referral_code, free_trial_used, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
        params![
            external_id,
            profile.username,
            profile.first_name,
            profile.last_name,
            profile.language_code.as_deref().unwrap_or("ar"),
            referral_code,
            now,
        ],
    )
    .map_err(|e| match unique_violation(&e) {
        Some(columns) => EntitlementError::Conflict(columns.to_string()),
        None => e.into(),
    })?;

    let id = conn.last_insert_rowid();
    get_user(conn, id)?.ok_or_else(|| EntitlementError::Internal("Failed to retrieve created user".into()))
}

/// Update profile fields in place. Returns true if anything changed.
pub fn update_profile(
    conn: &Connection,
    user: &User,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> Result<bool, EntitlementError> {
    let language = profile
        .language_code
        .clone()
        .unwrap_or_else(|| user.language_code.clone());

    if user.username == profile.username
        && user.first_name == profile.first_name
        && user.last_name == profile.last_name
        && user.language_code == language
    {
        return Ok(false);
    }

    conn.execute(
        "UPDATE users SET username = ?1, first_name = ?2, last_name = ?3, language_code = ?4,
                          updated_at = ?5
         WHERE id = ?6",
        params![
            profile.username,
            profile.first_name,
            profile.last_name,
            language,
            ts_to_sql(&now),
            user.id,
        ],
    )?;

    Ok(true)
}

/// Flag the one-time trial as consumed
pub fn mark_trial_used(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> Result<(), EntitlementError> {
    let updated = conn.execute(
        "UPDATE users SET free_trial_used = 1, updated_at = ?1 WHERE id = ?2",
        params![ts_to_sql(&now), user_id],
    )?;

    if updated == 0 {
        return Err(EntitlementError::not_found("User", user_id));
    }
    Ok(())
}
