//! Plan catalog operations

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ts_to_sql, NewPlan, Plan, PlanUpdate};
use crate::error::EntitlementError;

/// Get plan by ID
pub fn get_plan(conn: &Connection, id: i64) -> Result<Option<Plan>, EntitlementError> {
    conn.query_row("SELECT * FROM plans WHERE id = ?", params![id], Plan::from_row)
        .optional()
        .map_err(Into::into)
}

/// List plans ordered by id, optionally only those offered to buyers
pub fn list_plans(conn: &Connection, active_only: bool) -> Result<Vec<Plan>, EntitlementError> {
    let sql = if active_only {
        "SELECT * FROM plans WHERE is_active = 1 ORDER BY id"
    } else {
        "SELECT * FROM plans ORDER BY id"
    };

    let mut stmt = conn.prepare(sql)?;
    let plans = stmt
        .query_map([], Plan::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(plans)
}

pub fn count_plans(conn: &Connection) -> Result<i64, EntitlementError> {
    conn.query_row("SELECT COUNT(*) FROM plans", [], |row| row.get(0))
        .map_err(Into::into)
}

/// Insert a plan
pub fn insert_plan(conn: &Connection, input: &NewPlan) -> Result<Plan, EntitlementError> {
    if input.duration_days == 0 {
        return Err(EntitlementError::InvalidInput("duration_days must be positive".into()));
    }

    conn.execute(
        "INSERT INTO plans (name, name_local, duration_days, price, currency, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            input.name,
            input.name_local,
            input.duration_days,
            input.price,
            input.currency,
            input.is_active,
            ts_to_sql(&Utc::now()),
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_plan(conn, id)?.ok_or_else(|| EntitlementError::Internal("Failed to retrieve created plan".into()))
}

/// Apply an administrative edit
pub fn update_plan(conn: &Connection, id: i64, update: &PlanUpdate) -> Result<Plan, EntitlementError> {
    let current = get_plan(conn, id)?.ok_or_else(|| EntitlementError::not_found("Plan", id))?;

    let duration_days = update.duration_days.unwrap_or(current.duration_days);
    if duration_days == 0 {
        return Err(EntitlementError::InvalidInput("duration_days must be positive".into()));
    }

    conn.execute(
        "UPDATE plans SET name = ?1, name_local = ?2, duration_days = ?3, price = ?4,
                          currency = ?5, is_active = ?6
         WHERE id = ?7",
        params![
            update.name.as_ref().unwrap_or(&current.name),
            update.name_local.as_ref().or(current.name_local.as_ref()),
            duration_days,
            update.price.unwrap_or(current.price),
            update.currency.as_ref().unwrap_or(&current.currency),
            update.is_active.unwrap_or(current.is_active),
            id,
        ],
    )?;

    get_plan(conn, id)?.ok_or_else(|| EntitlementError::Internal("Failed to retrieve updated plan".into()))
}
