//! Payment reconciliation
//!
//! Payments start PENDING and move through [`crate::db::PaymentStatus::apply`].
//! Confirming a payment completes it and grants the entitlement in one store
//! transaction: the user's live subscription is activated, or a new ACTIVE
//! subscription is created for the paid plan, and the payment is linked to
//! it. A second confirmation of the same payment is `AlreadyCompleted` and
//! changes nothing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::db::{
    payments, plans, subscriptions, users, Amount, EntitlementStore, NewPayment, Payment,
    PaymentTransition, Subscription, Transition,
};
use crate::error::EntitlementError;

use super::events::{EntitlementEvent, EventBus};
use super::subscription_service::{self as lifecycle, LifecyclePolicy};

/// Details of a new payment intent
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: i64,
    pub plan_id: i64,
    pub amount: Amount,
    pub currency: String,
    pub provider: String,
    pub wallet_address: Option<String>,
    pub network: Option<String>,
}

/// Outcome of a successful confirmation
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub payment: Payment,
    pub subscription: Subscription,
    /// True when no live subscription existed and one was created
    pub created_subscription: bool,
}

pub struct PaymentService {
    store: Arc<EntitlementStore>,
    events: Arc<EventBus>,
    policy: LifecyclePolicy,
}

impl PaymentService {
    pub fn new(store: Arc<EntitlementStore>, events: Arc<EventBus>, policy: LifecyclePolicy) -> Self {
        Self {
            store,
            events,
            policy,
        }
    }

    /// Record a PENDING payment intent
    pub fn create_payment(&self, request: PaymentRequest) -> Result<Payment, EntitlementError> {
        if request.amount.minor_units() <= 0 {
            return Err(EntitlementError::InvalidInput("payment amount must be positive".into()));
        }

        let payment = self.store.with_tx(|tx| {
            if users::get_user(tx, request.user_id)?.is_none() {
                return Err(EntitlementError::not_found("User", request.user_id));
            }
            if plans::get_plan(tx, request.plan_id)?.is_none() {
                return Err(EntitlementError::not_found("Plan", request.plan_id));
            }
            payments::insert_payment(
                tx,
                &NewPayment {
                    user_id: request.user_id,
                    plan_id: request.plan_id,
                    amount: request.amount,
                    currency: request.currency.clone(),
                    provider: request.provider.clone(),
                    wallet_address: request.wallet_address.clone(),
                    network: request.network.clone(),
                },
                Utc::now(),
            )
        })?;

        info!(
            payment_id = payment.id,
            user_id = payment.user_id,
            plan_id = payment.plan_id,
            amount = %payment.amount,
            currency = %payment.currency,
            network = ?payment.network,
            "Created payment"
        );
        self.events.emit(EntitlementEvent::PaymentCreated {
            payment_id: payment.id,
            user_id: payment.user_id,
            plan_id: payment.plan_id,
        });
        Ok(payment)
    }

    /// Complete a payment and grant the entitlement it paid for.
    ///
    /// Either everything commits or nothing does. If the payment is already
    /// COMPLETED the call fails with `AlreadyCompleted` and no subscription is
    /// touched.
    ///
    /// A live subscription is activated, not extended: a TRIAL or ACTIVE
    /// subscription keeps its current `end_date`, so access after paying
    /// during a trial ends when the trial would have. Only a user with no live
    /// subscription gets a new one running `plan.duration_days` from now.
    pub fn confirm_payment(
        &self,
        payment_id: i64,
        transaction_id: Option<&str>,
    ) -> Result<Confirmation, EntitlementError> {
        let now = Utc::now();

        let (confirmation, transition) = self.store.with_tx(|tx| {
            let payment = payments::get_payment(tx, payment_id)?
                .ok_or_else(|| EntitlementError::not_found("Payment", payment_id))?;
            let next = payment.status.apply(payment_id, PaymentTransition::Complete)?;
            payments::update_status(tx, payment_id, next, transaction_id, now)?;

            let (subscription, created, transition) =
                match subscriptions::find_active_or_trial(tx, payment.user_id)? {
                    Some(live) => {
                        let outcome = lifecycle::transition_in(tx, live.id, Transition::Activate, now)?;
                        (outcome.subscription.clone(), false, Some(outcome))
                    }
                    None => {
                        let plan = plans::get_plan(tx, payment.plan_id)?
                            .ok_or_else(|| EntitlementError::not_found("Plan", payment.plan_id))?;
                        let created =
                            lifecycle::create_in(tx, &self.policy, payment.user_id, &plan, false, now)?;
                        (created, true, None)
                    }
                };

            payments::link_subscription(tx, payment_id, subscription.id, now)?;
            let payment = payments::get_payment(tx, payment_id)?
                .ok_or_else(|| EntitlementError::Internal("Failed to retrieve confirmed payment".into()))?;

            Ok((
                Confirmation {
                    payment,
                    subscription,
                    created_subscription: created,
                },
                transition,
            ))
        })?;

        let payment = &confirmation.payment;
        let subscription = &confirmation.subscription;
        info!(
            payment_id,
            user_id = payment.user_id,
            subscription_id = subscription.id,
            created = confirmation.created_subscription,
            transaction_id = ?payment.transaction_id,
            "Confirmed payment"
        );

        self.events.emit(EntitlementEvent::PaymentConfirmed {
            payment_id,
            user_id: payment.user_id,
            subscription_id: subscription.id,
        });
        if confirmation.created_subscription {
            self.events.emit(EntitlementEvent::SubscriptionCreated {
                subscription_id: subscription.id,
                user_id: subscription.user_id,
                plan_id: subscription.plan_id,
                is_trial: false,
            });
        } else if let Some(event) = transition.as_ref().and_then(lifecycle::transition_event) {
            self.events.emit(event);
        }

        Ok(confirmation)
    }

    /// PENDING to FAILED
    pub fn mark_failed(&self, payment_id: i64) -> Result<Payment, EntitlementError> {
        let payment = self.apply(payment_id, PaymentTransition::Fail)?;
        warn!(payment_id, "Payment marked failed");
        self.events.emit(EntitlementEvent::PaymentFailed { payment_id });
        Ok(payment)
    }

    /// COMPLETED to REFUNDED. The subscription it paid for is not revoked.
    pub fn refund(&self, payment_id: i64) -> Result<Payment, EntitlementError> {
        let payment = self.apply(payment_id, PaymentTransition::Refund)?;
        info!(payment_id, "Payment refunded");
        self.events.emit(EntitlementEvent::PaymentRefunded { payment_id });
        Ok(payment)
    }

    fn apply(&self, payment_id: i64, transition: PaymentTransition) -> Result<Payment, EntitlementError> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let payment = payments::get_payment(tx, payment_id)?
                .ok_or_else(|| EntitlementError::not_found("Payment", payment_id))?;
            let next = payment.status.apply(payment_id, transition)?;
            payments::update_status(tx, payment_id, next, None, now)?;
            payments::get_payment(tx, payment_id)?
                .ok_or_else(|| EntitlementError::Internal("Failed to retrieve updated payment".into()))
        })
    }

    pub fn get(&self, payment_id: i64) -> Result<Option<Payment>, EntitlementError> {
        self.store.with_conn(|conn| payments::get_payment(conn, payment_id))
    }

    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Payment>, EntitlementError> {
        self.store.with_conn(|conn| payments::list_for_user(conn, user_id))
    }

    pub fn pending_for_user(&self, user_id: i64) -> Result<Vec<Payment>, EntitlementError> {
        self.store
            .with_conn(|conn| payments::list_pending_for_user(conn, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewPlan, PaymentStatus, SubscriptionStatus, UserProfile};
    use crate::services::subscription_service::SubscriptionService;
    use chrono::Duration;

    struct Fixture {
        payments: PaymentService,
        lifecycle: SubscriptionService,
        user_id: i64,
        plan_id: i64,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(EntitlementStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let (user_id, plan_id) = store
            .with_tx(|tx| {
                let user = users::insert_user(tx, 900, &UserProfile::default(), "PAYS0001", Utc::now())?;
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
        let policy = LifecyclePolicy::default();
        Fixture {
            payments: PaymentService::new(store.clone(), events.clone(), policy),
            lifecycle: SubscriptionService::new(store, events, policy),
            user_id,
            plan_id,
        }
    }

    fn request(f: &Fixture) -> PaymentRequest {
        PaymentRequest {
            user_id: f.user_id,
            plan_id: f.plan_id,
            amount: Amount::from_major(30),
            currency: "USDT".into(),
            provider: "manual".into(),
            wallet_address: Some("TXwallet".into()),
            network: Some("TRC20".into()),
        }
    }

    #[test]
    fn test_confirm_creates_active_subscription() {
        let f = fixture();
        let payment = f.payments.create_payment(request(&f)).unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        let confirmation = f.payments.confirm_payment(payment.id, Some("0xfeed")).unwrap();
        assert!(confirmation.created_subscription);
        assert_eq!(confirmation.payment.status, PaymentStatus::Completed);
        assert_eq!(confirmation.payment.transaction_id.as_deref(), Some("0xfeed"));
        assert_eq!(confirmation.payment.subscription_id, Some(confirmation.subscription.id));

        let sub = &confirmation.subscription;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.end_date - sub.start_date, Duration::days(30));
    }

    #[test]
    fn test_second_confirm_is_already_completed() {
        let f = fixture();
        let payment = f.payments.create_payment(request(&f)).unwrap();
        let first = f.payments.confirm_payment(payment.id, None).unwrap();

        assert!(matches!(
            f.payments.confirm_payment(payment.id, None),
            Err(EntitlementError::AlreadyCompleted { payment_id }) if payment_id == payment.id
        ));

        let subs = f.lifecycle.list_for_user(f.user_id).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, first.subscription.id);
    }

    #[test]
    fn test_confirm_during_trial_activates_it() {
        let f = fixture();
        let trial = f.lifecycle.start_trial(f.user_id, f.plan_id).unwrap();
        let payment = f.payments.create_payment(request(&f)).unwrap();

        let confirmation = f.payments.confirm_payment(payment.id, None).unwrap();
        assert!(!confirmation.created_subscription);
        assert_eq!(confirmation.subscription.id, trial.id);
        assert_eq!(confirmation.subscription.status, SubscriptionStatus::Active);
        assert_eq!(confirmation.subscription.end_date, trial.end_date);
    }

    #[test]
    fn test_failed_payment_can_still_confirm() {
        let f = fixture();
        let payment = f.payments.create_payment(request(&f)).unwrap();
        let failed = f.payments.mark_failed(payment.id).unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.status.is_confirmable());

        let confirmation = f.payments.confirm_payment(payment.id, None).unwrap();
        assert_eq!(confirmation.payment.status, PaymentStatus::Completed);
    }

    #[test]
    fn test_refunded_payment_not_confirmable() {
        let f = fixture();
        let payment = f.payments.create_payment(request(&f)).unwrap();
        f.payments.confirm_payment(payment.id, None).unwrap();
        let refunded = f.payments.refund(payment.id).unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);

        assert!(matches!(
            f.payments.confirm_payment(payment.id, None),
            Err(EntitlementError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_duplicate_transaction_id_rolls_back() {
        let f = fixture();
        let first = f.payments.create_payment(request(&f)).unwrap();
        let second = f.payments.create_payment(request(&f)).unwrap();
        let confirmed = f.payments.confirm_payment(first.id, Some("0xdup")).unwrap();
        f.lifecycle.expire(confirmed.subscription.id).unwrap();

        assert!(matches!(
            f.payments.confirm_payment(second.id, Some("0xdup")),
            Err(EntitlementError::Conflict(_))
        ));
        let second = f.payments.get(second.id).unwrap().unwrap();
        assert_eq!(second.status, PaymentStatus::Pending);
        assert!(!f.lifecycle.has_live_subscription(f.user_id).unwrap());
    }

    #[test]
    fn test_unknown_plan_rejected() {
        let f = fixture();
        let mut req = request(&f);
        req.plan_id = 4242;
        assert!(matches!(
            f.payments.create_payment(req),
            Err(EntitlementError::NotFound { entity: "Plan", .. })
        ));
        assert!(f.payments.list_for_user(f.user_id).unwrap().is_empty());
    }
}
