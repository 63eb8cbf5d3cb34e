//! Expiry sweeper
//!
//! Periodically expires live subscriptions whose end date has passed and
//! removes their users from the channel in the same pass. A failure on one
//! subscription is logged and counted; the rest of the batch and the loop
//! carry on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::gate::AccessGateSynchronizer;
use crate::services::{SubscriptionService, UserService};

/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Counters for one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Subscriptions selected as past their end date
    pub examined: usize,
    /// Subscriptions moved to EXPIRED by this pass
    pub expired: usize,
    /// Users removed from the channel
    pub revoked: usize,
    /// Expired subscriptions whose user already held a new live one, left in
    /// the channel
    pub still_entitled: usize,
    /// Users re-admitted after a live subscription appeared during the ban
    pub restored: usize,
    pub gate_failures: usize,
    pub errors: usize,
}

pub struct ExpirySweeper {
    subscriptions: Arc<SubscriptionService>,
    users: Arc<UserService>,
    gate: Arc<AccessGateSynchronizer>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ExpirySweeper {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        users: Arc<UserService>,
        gate: Arc<AccessGateSynchronizer>,
    ) -> Self {
        Self {
            subscriptions,
            users,
            gate,
            interval: DEFAULT_SWEEP_INTERVAL,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Set the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one pass now
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one pass as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let due = match self.subscriptions.find_past_end_date(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to query due subscriptions");
                report.errors += 1;
                return report;
            }
        };
        report.examined = due.len();

        for candidate in due {
            let expired = match self.subscriptions.expire_if_due(candidate.id, now) {
                Ok(Some(expired)) => expired,
                Ok(None) => continue,
                Err(e) => {
                    error!(subscription_id = candidate.id, error = %e, "Failed to expire subscription");
                    report.errors += 1;
                    continue;
                }
            };
            report.expired += 1;

            // Revocation must happen in this pass; the next query will not see
            // an EXPIRED subscription again
            let user = match self.users.get(expired.user_id) {
                Ok(Some(user)) => user,
                Ok(None) => {
                    warn!(user_id = expired.user_id, "Expired subscription has no user");
                    report.errors += 1;
                    continue;
                }
                Err(e) => {
                    error!(user_id = expired.user_id, error = %e, "Failed to load user for revocation");
                    report.errors += 1;
                    continue;
                }
            };

            // A confirmation may have committed since the expiry
            if self.holds_live(expired.user_id, &mut report) {
                debug!(user_id = expired.user_id, "User holds a live subscription, not revoking");
                report.still_entitled += 1;
                continue;
            }

            if !self.gate.revoke(user.external_id).await {
                report.gate_failures += 1;
                continue;
            }
            report.revoked += 1;

            // The confirmation's grant may have run before our ban
            if self.holds_live(expired.user_id, &mut report) {
                info!(user_id = expired.user_id, "Live subscription appeared during revoke, re-admitting");
                if self.gate.grant(user.external_id).await.succeeded() {
                    report.restored += 1;
                } else {
                    report.gate_failures += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                revoked = report.revoked,
                still_entitled = report.still_entitled,
                restored = report.restored,
                gate_failures = report.gate_failures,
                errors = report.errors,
                "Sweep complete"
            );
        } else {
            debug!("Sweep found nothing due");
        }
        report
    }

    /// Whether the store currently grants `user_id` a trial or active
    /// subscription. A read failure counts as an error and as not live.
    fn holds_live(&self, user_id: i64, report: &mut SweepReport) -> bool {
        match self.subscriptions.has_live_subscription(user_id) {
            Ok(live) => live,
            Err(e) => {
                error!(user_id, error = %e, "Failed to re-check entitlement");
                report.errors += 1;
                false
            }
        }
    }

    /// Start the sweep loop. The first pass runs immediately.
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Expiry sweeper already running");
                return;
            }
            *running = true;
        }

        info!(interval = ?self.interval, "Starting expiry sweeper");

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if !*sweeper.running.read().await {
                    info!("Expiry sweeper stopped");
                    break;
                }

                sweeper.sweep().await;
            }
        });
    }

    /// Stop the sweep loop after the current pass
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping expiry sweeper");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
