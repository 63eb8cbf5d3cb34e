//! Subscription lifecycle manager
//!
//! The only component that changes subscription status. Every transition is
//! resolved by [`SubscriptionStatus::apply`] and persisted in one store
//! transaction; repeating a transition whose target already holds is a no-op
//! reported through [`TransitionOutcome::changed`].
//!
//! Payment confirmation reuses [`create_in`] and [`transition_in`] inside its
//! own transaction so that completing a payment and granting the entitlement
//! commit together.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::subscriptions::{self, NewSubscription};
use crate::db::{plans, users, EntitlementStore, Plan, Subscription, SubscriptionStatus, Transition, User};
use crate::error::EntitlementError;

use super::events::{EntitlementEvent, EventBus};

/// Lifecycle knobs taken from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Length of the one-time trial; zero disables trials
    pub trial_days: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self { trial_days: 7 }
    }
}

/// Result of a status transition
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub subscription: Subscription,
    /// False when the subscription was already in the target state
    pub changed: bool,
}

/// Create a subscription starting at `now` for `plan`.
///
/// Trials last `policy.trial_days`; paid subscriptions last the plan's
/// duration and start ACTIVE.
pub(crate) fn create_in(
    conn: &Connection,
    policy: &LifecyclePolicy,
    user_id: i64,
    plan: &Plan,
    is_trial: bool,
    now: DateTime<Utc>,
) -> Result<Subscription, EntitlementError> {
    let (status, days) = if is_trial {
        if policy.trial_days == 0 {
            return Err(EntitlementError::TrialUnavailable { user_id });
        }
        (SubscriptionStatus::Trial, policy.trial_days)
    } else {
        (SubscriptionStatus::Active, plan.duration_days)
    };

    subscriptions::insert_subscription(
        conn,
        &NewSubscription {
            user_id,
            plan_id: plan.id,
            status,
            start_date: now,
            end_date: now + Duration::days(i64::from(days)),
            is_trial,
        },
        now,
    )
}

/// Apply `transition` to subscription `id`.
pub(crate) fn transition_in(
    conn: &Connection,
    id: i64,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, EntitlementError> {
    let current = subscriptions::get_subscription(conn, id)?
        .ok_or_else(|| EntitlementError::not_found("Subscription", id))?;

    let next = current.status.apply(transition)?;
    if next == current.status {
        return Ok(TransitionOutcome {
            subscription: current,
            changed: false,
        });
    }

    // A paid activation ends the trial period
    let is_trial = current.is_trial && next != SubscriptionStatus::Active;
    let subscription = subscriptions::update_status(conn, id, next, is_trial, now)?;
    Ok(TransitionOutcome {
        subscription,
        changed: true,
    })
}

/// Event describing a committed transition, if anything changed
pub(crate) fn transition_event(outcome: &TransitionOutcome) -> Option<EntitlementEvent> {
    if !outcome.changed {
        return None;
    }
    let subscription_id = outcome.subscription.id;
    let user_id = outcome.subscription.user_id;
    match outcome.subscription.status {
        SubscriptionStatus::Active => Some(EntitlementEvent::SubscriptionActivated {
            subscription_id,
            user_id,
        }),
        SubscriptionStatus::Expired => Some(EntitlementEvent::SubscriptionExpired {
            subscription_id,
            user_id,
        }),
        SubscriptionStatus::Cancelled => Some(EntitlementEvent::SubscriptionCancelled {
            subscription_id,
            user_id,
        }),
        SubscriptionStatus::Trial => None,
    }
}

pub struct SubscriptionService {
    store: Arc<EntitlementStore>,
    events: Arc<EventBus>,
    policy: LifecyclePolicy,
}

impl SubscriptionService {
    pub fn new(store: Arc<EntitlementStore>, events: Arc<EventBus>, policy: LifecyclePolicy) -> Self {
        Self {
            store,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Create a subscription for `user_id` on `plan_id`.
    ///
    /// Fails with `AlreadySubscribed` while the user holds a trial or active
    /// subscription.
    pub fn create(
        &self,
        user_id: i64,
        plan_id: i64,
        is_trial: bool,
    ) -> Result<Subscription, EntitlementError> {
        let now = Utc::now();
        let subscription = self.store.with_tx(|tx| {
            if users::get_user(tx, user_id)?.is_none() {
                return Err(EntitlementError::not_found("User", user_id));
            }
            let plan = plans::get_plan(tx, plan_id)?
                .ok_or_else(|| EntitlementError::not_found("Plan", plan_id))?;
            create_in(tx, &self.policy, user_id, &plan, is_trial, now)
        })?;

        self.announce_created(&subscription);
        Ok(subscription)
    }

    /// Start the user's one-time trial on an offered plan.
    ///
    /// Consuming the trial flag and creating the TRIAL subscription commit
    /// together; any refusal leaves both untouched.
    pub fn start_trial(&self, user_id: i64, plan_id: i64) -> Result<Subscription, EntitlementError> {
        let now = Utc::now();
        let subscription = self.store.with_tx(|tx| {
            let user = users::get_user(tx, user_id)?
                .ok_or_else(|| EntitlementError::not_found("User", user_id))?;
            if subscriptions::find_active_or_trial(tx, user_id)?.is_some() {
                return Err(EntitlementError::AlreadySubscribed { user_id });
            }
            if !self.can_use_free_trial(&user) {
                return Err(EntitlementError::TrialUnavailable { user_id });
            }

            let plan = plans::get_plan(tx, plan_id)?
                .ok_or_else(|| EntitlementError::not_found("Plan", plan_id))?;
            if !plan.is_active {
                return Err(EntitlementError::PlanUnavailable { plan_id });
            }

            let subscription = create_in(tx, &self.policy, user_id, &plan, true, now)?;
            users::mark_trial_used(tx, user_id, now)?;
            Ok(subscription)
        })?;

        self.announce_created(&subscription);
        self.events.emit(EntitlementEvent::TrialConsumed {
            user_id,
            subscription_id: subscription.id,
        });
        Ok(subscription)
    }

    /// TRIAL/EXPIRED to ACTIVE. The end date is left as it is.
    pub fn activate(&self, id: i64) -> Result<TransitionOutcome, EntitlementError> {
        self.transition(id, Transition::Activate)
    }

    pub fn expire(&self, id: i64) -> Result<TransitionOutcome, EntitlementError> {
        self.transition(id, Transition::Expire)
    }

    pub fn cancel(&self, id: i64) -> Result<TransitionOutcome, EntitlementError> {
        self.transition(id, Transition::Cancel)
    }

    /// Expire `id` only if it is still live and past its end date at `now`.
    ///
    /// The check and the transition run in one transaction, so a subscription
    /// renewed or cancelled since it was selected is left alone (`Ok(None)`).
    pub fn expire_if_due(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, EntitlementError> {
        let outcome = self.store.with_tx(|tx| {
            let current = subscriptions::get_subscription(tx, id)?
                .ok_or_else(|| EntitlementError::not_found("Subscription", id))?;
            if !current.is_due(now) {
                return Ok(None);
            }
            transition_in(tx, id, Transition::Expire, now).map(Some)
        })?;

        match outcome {
            Some(outcome) => {
                self.announce_transition(&outcome);
                Ok(Some(outcome.subscription))
            }
            None => {
                debug!(subscription_id = id, "Subscription no longer due, skipping");
                Ok(None)
            }
        }
    }

    fn transition(&self, id: i64, transition: Transition) -> Result<TransitionOutcome, EntitlementError> {
        let now = Utc::now();
        let outcome = self
            .store
            .with_tx(|tx| transition_in(tx, id, transition, now))?;
        self.announce_transition(&outcome);
        Ok(outcome)
    }

    pub fn get(&self, id: i64) -> Result<Option<Subscription>, EntitlementError> {
        self.store.with_conn(|conn| subscriptions::get_subscription(conn, id))
    }

    /// The user's live (trial or active) subscription
    pub fn find_active_or_trial(&self, user_id: i64) -> Result<Option<Subscription>, EntitlementError> {
        self.store
            .with_conn(|conn| subscriptions::find_active_or_trial(conn, user_id))
    }

    pub fn has_live_subscription(&self, user_id: i64) -> Result<bool, EntitlementError> {
        Ok(self.find_active_or_trial(user_id)?.is_some())
    }

    /// Whether the user holds a paid ACTIVE subscription (trials excluded)
    pub fn has_active_subscription(&self, user_id: i64) -> Result<bool, EntitlementError> {
        Ok(self
            .find_active_or_trial(user_id)?
            .is_some_and(|s| s.status == SubscriptionStatus::Active))
    }

    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Subscription>, EntitlementError> {
        self.store.with_conn(|conn| subscriptions::list_for_user(conn, user_id))
    }

    /// Live subscriptions whose end date is before `now`
    pub fn find_past_end_date(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, EntitlementError> {
        self.store
            .with_conn(|conn| subscriptions::find_past_end_date(conn, now))
    }

    /// Whether `user` may still start a trial
    pub fn can_use_free_trial(&self, user: &User) -> bool {
        !user.free_trial_used && self.policy.trial_days > 0
    }

    fn announce_created(&self, subscription: &Subscription) {
        info!(
            subscription_id = subscription.id,
            user_id = subscription.user_id,
            plan_id = subscription.plan_id,
            is_trial = subscription.is_trial,
            end_date = %subscription.end_date,
            "Created subscription"
        );
        self.events.emit(EntitlementEvent::SubscriptionCreated {
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            plan_id: subscription.plan_id,
            is_trial: subscription.is_trial,
        });
    }

    fn announce_transition(&self, outcome: &TransitionOutcome) {
        if let Some(event) = transition_event(outcome) {
            info!(
                subscription_id = outcome.subscription.id,
                status = %outcome.subscription.status,
                "Subscription transitioned"
            );
            self.events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Amount, NewPlan, UserProfile};

    struct Fixture {
        service: SubscriptionService,
        store: Arc<EntitlementStore>,
        user_id: i64,
        plan_id: i64,
    }

    fn fixture(policy: LifecyclePolicy) -> Fixture {
        let store = Arc::new(EntitlementStore::open_in_memory().unwrap());
        let (user_id, plan_id) = store
            .with_tx(|tx| {
                let user = users::insert_user(tx, 500, &UserProfile::default(), "LIFE0001", Utc::now())?;
                let plan = plans::insert_plan(
                    tx,
                    &NewPlan {
                        name: "Monthly".into(),
                        name_local: None,
                        duration_days: 30,
                        price: Amount::from_major(30),
                        currency: "USDT".into(),
                        is_active: true,
                    },
                )?;
                Ok((user.id, plan.id))
            })
            .unwrap();
        Fixture {
            service: SubscriptionService::new(store.clone(), Arc::new(EventBus::new()), policy),
            store,
            user_id,
            plan_id,
        }
    }

    #[test]
    fn test_trial_window_uses_trial_days() {
        let f = fixture(LifecyclePolicy { trial_days: 7 });
        let sub = f.service.start_trial(f.user_id, f.plan_id).unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert!(sub.is_trial);
        assert_eq!(sub.end_date - sub.start_date, Duration::days(7));

        let user = f.store.with_conn(|c| users::get_user(c, f.user_id)).unwrap().unwrap();
        assert!(user.free_trial_used);
    }

    #[test]
    fn test_second_trial_while_live_is_already_subscribed() {
        let f = fixture(LifecyclePolicy::default());
        f.service.start_trial(f.user_id, f.plan_id).unwrap();

        assert!(matches!(
            f.service.start_trial(f.user_id, f.plan_id),
            Err(EntitlementError::AlreadySubscribed { .. })
        ));
        assert!(f.service.has_live_subscription(f.user_id).unwrap());
        assert!(!f.service.has_active_subscription(f.user_id).unwrap());
    }

    #[test]
    fn test_trial_is_single_use() {
        let f = fixture(LifecyclePolicy::default());
        let sub = f.service.start_trial(f.user_id, f.plan_id).unwrap();
        f.service.expire(sub.id).unwrap();

        assert!(matches!(
            f.service.start_trial(f.user_id, f.plan_id),
            Err(EntitlementError::TrialUnavailable { .. })
        ));
    }

    #[test]
    fn test_trial_refused_while_subscribed_keeps_flag() {
        let f = fixture(LifecyclePolicy::default());
        f.service.create(f.user_id, f.plan_id, false).unwrap();

        assert!(matches!(
            f.service.start_trial(f.user_id, f.plan_id),
            Err(EntitlementError::AlreadySubscribed { .. })
        ));
        let user = f.store.with_conn(|c| users::get_user(c, f.user_id)).unwrap().unwrap();
        assert!(!user.free_trial_used);
    }

    #[test]
    fn test_zero_trial_days_disables_trials() {
        let f = fixture(LifecyclePolicy { trial_days: 0 });
        assert!(matches!(
            f.service.start_trial(f.user_id, f.plan_id),
            Err(EntitlementError::TrialUnavailable { .. })
        ));
    }

    #[test]
    fn test_paid_subscription_uses_plan_duration() {
        let f = fixture(LifecyclePolicy::default());
        let sub = f.service.create(f.user_id, f.plan_id, false).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.end_date - sub.start_date, Duration::days(30));

        assert!(matches!(
            f.service.create(f.user_id, f.plan_id, false),
            Err(EntitlementError::AlreadySubscribed { .. })
        ));
    }

    #[test]
    fn test_activate_trial_keeps_end_date() {
        let f = fixture(LifecyclePolicy::default());
        let trial = f.service.start_trial(f.user_id, f.plan_id).unwrap();

        let outcome = f.service.activate(trial.id).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.subscription.status, SubscriptionStatus::Active);
        assert!(!outcome.subscription.is_trial);
        assert_eq!(outcome.subscription.end_date, trial.end_date);

        let again = f.service.activate(trial.id).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_expire_is_idempotent() {
        let f = fixture(LifecyclePolicy::default());
        let sub = f.service.create(f.user_id, f.plan_id, false).unwrap();

        assert!(f.service.expire(sub.id).unwrap().changed);
        let again = f.service.expire(sub.id).unwrap();
        assert!(!again.changed);
        assert_eq!(again.subscription.status, SubscriptionStatus::Expired);
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let f = fixture(LifecyclePolicy::default());
        let sub = f.service.create(f.user_id, f.plan_id, false).unwrap();
        f.service.cancel(sub.id).unwrap();

        assert!(matches!(
            f.service.activate(sub.id),
            Err(EntitlementError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.service.expire(sub.id),
            Err(EntitlementError::InvalidTransition { .. })
        ));
        assert!(!f.service.has_live_subscription(f.user_id).unwrap());
    }

    #[test]
    fn test_expire_if_due_rechecks() {
        let f = fixture(LifecyclePolicy::default());
        let sub = f.service.create(f.user_id, f.plan_id, false).unwrap();

        assert!(f.service.expire_if_due(sub.id, Utc::now()).unwrap().is_none());

        let later = sub.end_date + Duration::seconds(1);
        let expired = f.service.expire_if_due(sub.id, later).unwrap().unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
        assert!(f.service.expire_if_due(sub.id, later).unwrap().is_none());
    }

    #[test]
    fn test_unknown_subscription() {
        let f = fixture(LifecyclePolicy::default());
        assert!(matches!(
            f.service.activate(12345),
            Err(EntitlementError::NotFound { entity: "Subscription", .. })
        ));
    }
}
