//! Entitlement entities and their status state machines
//!
//! Status columns are stored as lowercase text. All legal moves between
//! states live in [`SubscriptionStatus::apply`] and [`PaymentStatus::apply`];
//! services never assign a status directly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EntitlementError;

// ============================================================================
// Timestamps
// ============================================================================

/// Fixed-width UTC format so text ordering matches time ordering
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Render a timestamp for storage
pub fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp
pub fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ")?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn get_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    ts_from_sql(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

// ============================================================================
// Money
// ============================================================================

/// Monetary amount in minor units (cents)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub i64);

impl Amount {
    pub fn from_major(units: i64) -> Self {
        Self(units * 100)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl ToSql for Amount {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Amount {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(Amount)
    }
}

// ============================================================================
// Status state machines
// ============================================================================

#[derive(Debug, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(String);

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Expired,
    Cancelled,
}

/// A requested subscription state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Expire,
    Cancel,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Expire => "expire",
            Self::Cancel => "cancel",
        }
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Trial or active: the user currently holds the entitlement
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }

    /// Resolve a transition. `Ok(self)` means the move is an idempotent no-op.
    pub fn apply(self, transition: Transition) -> Result<SubscriptionStatus, EntitlementError> {
        use SubscriptionStatus::*;
        match (self, transition) {
            (Trial | Expired | Active, Transition::Activate) => Ok(Active),
            (Trial | Active | Expired, Transition::Expire) => Ok(Expired),
            (Trial | Active | Cancelled, Transition::Cancel) => Ok(Cancelled),
            (from, t) => Err(EntitlementError::InvalidTransition {
                entity: "subscription",
                from: from.to_string(),
                action: t.as_str(),
            }),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// A requested payment state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    Complete,
    Fail,
    Refund,
}

impl PaymentTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Refund => "refund",
        }
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Whether a confirmation could still succeed
    pub fn is_confirmable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// Resolve a transition. Completion happens at most once per payment.
    pub fn apply(
        self,
        payment_id: i64,
        transition: PaymentTransition,
    ) -> Result<PaymentStatus, EntitlementError> {
        use PaymentStatus::*;
        match (self, transition) {
            (Pending | Failed, PaymentTransition::Complete) => Ok(Completed),
            (Completed, PaymentTransition::Complete) => {
                Err(EntitlementError::AlreadyCompleted { payment_id })
            }
            (Pending, PaymentTransition::Fail) => Ok(Failed),
            (Completed, PaymentTransition::Refund) => Ok(Refunded),
            (from, t) => Err(EntitlementError::InvalidTransition {
                entity: "payment",
                from: from.to_string(),
                action: t.as_str(),
            }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownStatus| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(SubscriptionStatus);
text_enum_sql!(PaymentStatus);

// ============================================================================
// Rows
// ============================================================================

/// User row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Messaging platform user id
    pub external_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: String,
    pub referral_code: String,
    pub free_trial_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            external_id: row.get("external_id")?,
            username: row.get("username")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            language_code: row.get("language_code")?,
            referral_code: row.get("referral_code")?,
            free_trial_used: row.get("free_trial_used")?,
            created_at: get_ts(row, "created_at")?,
            updated_at: get_ts(row, "updated_at")?,
        })
    }
}

/// Mutable profile fields reported by the messaging platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

/// Catalog plan row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    /// Localized display name
    pub name_local: Option<String>,
    pub duration_days: u32,
    pub price: Amount,
    pub currency: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            name_local: row.get("name_local")?,
            duration_days: row.get("duration_days")?,
            price: row.get("price")?,
            currency: row.get("currency")?,
            is_active: row.get("is_active")?,
            created_at: get_ts(row, "created_at")?,
        })
    }

    pub fn display_name(&self) -> &str {
        self.name_local.as_deref().unwrap_or(&self.name)
    }
}

/// Input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub name_local: Option<String>,
    pub duration_days: u32,
    pub price: Amount,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_currency() -> String {
    "USDT".to_string()
}

fn default_true() -> bool {
    true
}

/// Administrative plan edit; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub name_local: Option<String>,
    pub duration_days: Option<u32>,
    pub price: Option<Amount>,
    pub currency: Option<String>,
    pub is_active: Option<bool>,
}

/// Subscription row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_trial: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            plan_id: row.get("plan_id")?,
            status: row.get("status")?,
            start_date: get_ts(row, "start_date")?,
            end_date: get_ts(row, "end_date")?,
            is_trial: row.get("is_trial")?,
            created_at: get_ts(row, "created_at")?,
            updated_at: get_ts(row, "updated_at")?,
        })
    }

    /// Past its window at `now` while still holding the entitlement
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && self.end_date < now
    }
}

/// Payment row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub subscription_id: Option<i64>,
    pub amount: Amount,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: String,
    /// Payment rail identifier (e.g. TRC20)
    pub network: Option<String>,
    pub wallet_address: Option<String>,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            plan_id: row.get("plan_id")?,
            subscription_id: row.get("subscription_id")?,
            amount: row.get("amount")?,
            currency: row.get("currency")?,
            status: row.get("status")?,
            provider: row.get("provider")?,
            network: row.get("network")?,
            wallet_address: row.get("wallet_address")?,
            transaction_id: row.get("transaction_id")?,
            created_at: get_ts(row, "created_at")?,
            updated_at: get_ts(row, "updated_at")?,
        })
    }
}

/// Input for creating a pending payment intent
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: i64,
    pub plan_id: i64,
    pub amount: Amount,
    pub currency: String,
    pub provider: String,
    pub wallet_address: Option<String>,
    pub network: Option<String>,
}

/// Referral row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_id: i64,
    pub points_awarded: i64,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            referrer_id: row.get("referrer_id")?,
            referred_id: row.get("referred_id")?,
            points_awarded: row.get("points_awarded")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

/// Referral points ledger entry (negative for redemptions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralPoint {
    pub id: i64,
    pub user_id: i64,
    pub points: i64,
    pub description: Option<String>,
    pub referral_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ReferralPoint {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            points: row.get("points")?,
            description: row.get("description")?,
            referral_id: row.get("referral_id")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}
