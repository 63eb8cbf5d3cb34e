//! Referral ledger service
//!
//! A referral is recorded once per (referrer, referred) pair and credits the
//! referrer with [`REFERRAL_POINTS`] in the same transaction. Points can be
//! spent with [`ReferralService::deduct_points`], which never lets a balance
//! go negative.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{referrals, users, EntitlementStore, Referral, ReferralPoint};
use crate::error::EntitlementError;

use super::events::{EntitlementEvent, EventBus};

/// Points credited to a referrer per referred user
pub const REFERRAL_POINTS: i64 = 10;

/// Summary shown to a user about their referrals
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralStats {
    pub total_referrals: i64,
    pub total_points: i64,
    pub points_per_referral: i64,
}

/// Record a referral inside an open transaction. The flag is false when the
/// pair was already recorded and nothing was awarded.
pub(crate) fn record_in(
    conn: &Connection,
    referrer_id: i64,
    referred_id: i64,
    now: DateTime<Utc>,
) -> Result<(Referral, bool), EntitlementError> {
    if let Some(existing) = referrals::find_referral(conn, referrer_id, referred_id)? {
        return Ok((existing, false));
    }
    for id in [referrer_id, referred_id] {
        if users::get_user(conn, id)?.is_none() {
            return Err(EntitlementError::not_found("User", id));
        }
    }
    let referral = referrals::insert_referral(conn, referrer_id, referred_id, REFERRAL_POINTS, now)?;
    Ok((referral, true))
}

pub(crate) fn announce_referral(events: &EventBus, referral: &Referral, created: bool) {
    let (referrer_id, referred_id) = (referral.referrer_id, referral.referred_id);
    if created {
        info!(referrer_id, referred_id, points = referral.points_awarded, "Recorded referral");
        events.emit(EntitlementEvent::ReferralRecorded {
            referrer_id,
            referred_id,
            points: referral.points_awarded,
        });
    } else {
        debug!(referrer_id, referred_id, "Referral already recorded");
    }
}

pub struct ReferralService {
    store: Arc<EntitlementStore>,
    events: Arc<EventBus>,
}

impl ReferralService {
    pub fn new(store: Arc<EntitlementStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Record that `referrer_id` brought in `referred_id`.
    ///
    /// Self-referrals are ignored (`Ok(None)`). Repeating a pair returns the
    /// existing record without awarding points again.
    pub fn process_referral(
        &self,
        referrer_id: i64,
        referred_id: i64,
    ) -> Result<Option<Referral>, EntitlementError> {
        if referrer_id == referred_id {
            warn!(user_id = referrer_id, "Ignoring self-referral");
            return Ok(None);
        }

        let (referral, created) = self
            .store
            .with_tx(|tx| record_in(tx, referrer_id, referred_id, Utc::now()))?;
        announce_referral(&self.events, &referral, created);

        Ok(Some(referral))
    }

    pub fn total_points(&self, user_id: i64) -> Result<i64, EntitlementError> {
        self.store.with_conn(|conn| referrals::total_points(conn, user_id))
    }

    pub fn points_history(&self, user_id: i64) -> Result<Vec<ReferralPoint>, EntitlementError> {
        self.store.with_conn(|conn| referrals::points_history(conn, user_id))
    }

    /// Spend `points` from the user's balance. Returns false, recording
    /// nothing, when the balance is insufficient.
    pub fn deduct_points(
        &self,
        user_id: i64,
        points: i64,
        description: &str,
    ) -> Result<bool, EntitlementError> {
        if points <= 0 {
            return Err(EntitlementError::InvalidInput(
                "points to deduct must be positive".into(),
            ));
        }

        let deducted = self.store.with_tx(|tx| {
            let balance = referrals::total_points(tx, user_id)?;
            if balance < points {
                return Ok(false);
            }
            referrals::insert_points(tx, user_id, -points, Some(description), None, Utc::now())?;
            Ok(true)
        })?;

        if deducted {
            info!(user_id, points, "Deducted referral points");
        }
        Ok(deducted)
    }

    pub fn stats(&self, user_id: i64) -> Result<ReferralStats, EntitlementError> {
        self.store.with_conn(|conn| {
            Ok(ReferralStats {
                total_referrals: referrals::count_referrals(conn, user_id)?,
                total_points: referrals::total_points(conn, user_id)?,
                points_per_referral: REFERRAL_POINTS,
            })
        })
    }
}
