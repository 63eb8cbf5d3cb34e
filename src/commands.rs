//! Inbound command surface
//!
//! One method per user or admin action. Each runs the entitlement change
//! through the services first and touches the channel gate only after it has
//! committed; a gate failure shows up in the returned [`GateGrant`] and never
//! as an error. Errors returned here are meant to be rendered with
//! [`EntitlementError::user_facing`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::db::{Payment, Plan, Referral, Subscription, User, UserProfile};
use crate::error::EntitlementError;
use crate::gate::{AccessGateSynchronizer, GateGrant};
use crate::services::{Confirmation, PaymentRequest, ReferralStats, Registration, Services};

/// Result of `start`
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub user: User,
    pub created: bool,
    /// Referral recorded for this start, if any
    pub referral: Option<Referral>,
}

/// A plan as shown to a specific user
#[derive(Debug, Clone, Serialize)]
pub struct PlanView {
    pub plan: Plan,
    pub can_use_trial: bool,
    pub has_active_subscription: bool,
}

#[derive(Debug, Clone)]
pub struct TrialActivation {
    pub subscription: Subscription,
    pub gate: GateGrant,
}

/// What the user needs to complete a payment
#[derive(Debug, Clone, Serialize)]
pub struct PaymentInstructions {
    pub payment: Payment,
    pub plan: Plan,
    pub network: String,
    pub network_label: String,
    pub wallet_address: String,
}

#[derive(Debug, Clone)]
pub struct PaymentActivation {
    pub confirmation: Confirmation,
    pub gate: GateGrant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub subscription: Subscription,
    pub plan: Option<Plan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralOverview {
    pub referral_code: String,
    #[serde(flatten)]
    pub stats: ReferralStats,
}

pub struct CommandHandler {
    services: Arc<Services>,
    gate: Arc<AccessGateSynchronizer>,
    config: Arc<Config>,
}

impl CommandHandler {
    pub fn new(services: Arc<Services>, gate: Arc<AccessGateSynchronizer>, config: Arc<Config>) -> Self {
        Self {
            services,
            gate,
            config,
        }
    }

    /// First contact (or re-contact) from a user, optionally via a referral code
    #[instrument(skip(self, profile))]
    pub async fn start(
        &self,
        external_id: i64,
        profile: &UserProfile,
        referral_code: Option<&str>,
    ) -> Result<StartOutcome, EntitlementError> {
        let Registration {
            user,
            created,
            referral,
        } = self.services.users.register(external_id, profile, referral_code)?;

        Ok(StartOutcome {
            user,
            created,
            referral,
        })
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>, EntitlementError> {
        self.services.plans.list_active()
    }

    pub async fn view_plan(&self, external_id: i64, plan_id: i64) -> Result<PlanView, EntitlementError> {
        let plan = self.services.plans.require_offered(plan_id)?;
        let user = self.services.users.find_by_external_id(external_id)?;

        let (can_use_trial, has_active_subscription) = match &user {
            Some(user) => (
                self.services.subscriptions.can_use_free_trial(user),
                self.services.subscriptions.has_active_subscription(user.id)?,
            ),
            None => (false, false),
        };

        Ok(PlanView {
            plan,
            can_use_trial,
            has_active_subscription,
        })
    }

    /// Start the one-time trial and admit the user to the channel
    #[instrument(skip(self))]
    pub async fn activate_trial(&self, external_id: i64, plan_id: i64) -> Result<TrialActivation, EntitlementError> {
        let user = self.services.users.require_by_external_id(external_id)?;
        let subscription = self.services.subscriptions.start_trial(user.id, plan_id)?;

        let gate = self.gate.grant(external_id).await;
        if !gate.succeeded() {
            warn!(subscription_id = subscription.id, "Trial started but channel access not granted");
        }

        Ok(TrialActivation { subscription, gate })
    }

    /// Create a pending payment for `plan_id` on `network`
    #[instrument(skip(self))]
    pub async fn initiate_payment(
        &self,
        external_id: i64,
        plan_id: i64,
        network: &str,
    ) -> Result<PaymentInstructions, EntitlementError> {
        let user = self.services.users.require_by_external_id(external_id)?;
        let plan = self.services.plans.require_offered(plan_id)?;

        if self.services.subscriptions.has_active_subscription(user.id)? {
            return Err(EntitlementError::AlreadySubscribed { user_id: user.id });
        }

        let network = self
            .config
            .network(network)
            .ok_or_else(|| EntitlementError::InvalidInput(format!("Unknown payment network: {network}")))?;
        if network.wallet_address.trim().is_empty() {
            return Err(EntitlementError::InvalidInput(format!(
                "Payments on {} are not available",
                network.name
            )));
        }

        let payment = self.services.payments.create_payment(PaymentRequest {
            user_id: user.id,
            plan_id: plan.id,
            amount: plan.price,
            currency: plan.currency.clone(),
            provider: self.config.payments.provider.clone(),
            wallet_address: Some(network.wallet_address.clone()),
            network: Some(network.name.clone()),
        })?;

        Ok(PaymentInstructions {
            payment,
            plan,
            network: network.name.clone(),
            network_label: network.label.clone(),
            wallet_address: network.wallet_address.clone(),
        })
    }

    /// The paying user reports their payment as sent
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, external_id: i64, payment_id: i64) -> Result<PaymentActivation, EntitlementError> {
        let user = self.services.users.require_by_external_id(external_id)?;
        let payment = self
            .services
            .payments
            .get(payment_id)?
            .ok_or_else(|| EntitlementError::not_found("Payment", payment_id))?;
        if payment.user_id != user.id {
            warn!(payment_id, "Confirmation attempted by non-owner");
            return Err(EntitlementError::Forbidden(format!(
                "payment {payment_id} belongs to another user"
            )));
        }

        let confirmation = self.services.payments.confirm_payment(payment_id, None)?;
        let gate = self.gate.grant(external_id).await;
        Ok(PaymentActivation { confirmation, gate })
    }

    /// Administrative or webhook confirmation, optionally with the on-chain
    /// transaction id
    #[instrument(skip(self))]
    pub async fn confirm_payment_as_admin(
        &self,
        admin_external_id: i64,
        payment_id: i64,
        transaction_id: Option<&str>,
    ) -> Result<PaymentActivation, EntitlementError> {
        if !self.config.is_admin(admin_external_id) {
            warn!(admin_external_id, "Non-admin attempted payment confirmation");
            return Err(EntitlementError::Forbidden("admin rights required".into()));
        }

        let confirmation = self.services.payments.confirm_payment(payment_id, transaction_id)?;
        let owner = self
            .services
            .users
            .get(confirmation.payment.user_id)?
            .ok_or_else(|| EntitlementError::not_found("User", confirmation.payment.user_id))?;

        info!(admin_external_id, payment_id, "Payment confirmed by admin");
        let gate = self.gate.grant(owner.external_id).await;
        Ok(PaymentActivation { confirmation, gate })
    }

    /// Subscription history, newest first
    pub async fn view_subscriptions(&self, external_id: i64) -> Result<Vec<SubscriptionSummary>, EntitlementError> {
        let user = self.services.users.require_by_external_id(external_id)?;
        self.services
            .subscriptions
            .list_for_user(user.id)?
            .into_iter()
            .map(|subscription| -> Result<SubscriptionSummary, EntitlementError> {
                let plan = self.services.plans.get(subscription.plan_id)?;
                Ok(SubscriptionSummary { subscription, plan })
            })
            .collect()
    }

    pub async fn view_referral_stats(&self, external_id: i64) -> Result<ReferralOverview, EntitlementError> {
        let user = self.services.users.require_by_external_id(external_id)?;
        let stats = self.services.referrals.stats(user.id)?;
        Ok(ReferralOverview {
            referral_code: user.referral_code,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EntitlementStore;
    use crate::gate::{GateError, GateSettings, GateTransport, MemberStatus};
    use crate::services::{EventBus, REFERRAL_POINTS};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct OpenGate;

    #[async_trait]
    impl GateTransport for OpenGate {
        async fn unban(&self, _external_id: i64, _only_if_banned: bool) -> Result<(), GateError> {
            Ok(())
        }

        async fn ban(&self, _external_id: i64) -> Result<(), GateError> {
            Ok(())
        }

        async fn create_invite_link(&self, _expire_at: DateTime<Utc>) -> Result<String, GateError> {
            Ok("https://t.me/+open".into())
        }

        async fn member_status(&self, _external_id: i64) -> Result<MemberStatus, GateError> {
            Ok(MemberStatus::Member)
        }
    }

    fn handler() -> CommandHandler {
        let mut config = Config::default();
        config.admin_ids = vec![1];
        config.set_wallet("TRC20", "TXwallet".into());

        let store = Arc::new(EntitlementStore::open_in_memory().unwrap());
        let services = Arc::new(Services::new(store, config.lifecycle_policy()));
        services.plans.seed_defaults().unwrap();
        let gate = Arc::new(AccessGateSynchronizer::new(
            Arc::new(OpenGate),
            Arc::new(EventBus::new()),
            GateSettings::default(),
        ));
        CommandHandler::new(services, gate, Arc::new(config))
    }

    #[tokio::test]
    async fn test_start_with_referral_code() {
        let handler = handler();
        let referrer = handler.start(100, &UserProfile::default(), None).await.unwrap();

        let referred = handler
            .start(200, &UserProfile::default(), Some(&referrer.user.referral_code))
            .await
            .unwrap();
        assert!(referred.created);
        assert!(referred.referral.is_some());

        // Returning users do not trigger referrals again
        let again = handler
            .start(200, &UserProfile::default(), Some(&referrer.user.referral_code))
            .await
            .unwrap();
        assert!(!again.created);
        assert!(again.referral.is_none());

        let overview = handler.view_referral_stats(100).await.unwrap();
        assert_eq!(overview.stats.total_referrals, 1);
        assert_eq!(overview.stats.total_points, REFERRAL_POINTS);
    }

    #[tokio::test]
    async fn test_unknown_referral_code_ignored() {
        let handler = handler();
        let unknown = handler
            .start(300, &UserProfile::default(), Some("NOSUCH00"))
            .await
            .unwrap();
        assert!(unknown.referral.is_none());
    }

    #[tokio::test]
    async fn test_view_plan_reflects_trial_eligibility() {
        let handler = handler();
        handler.start(10, &UserProfile::default(), None).await.unwrap();
        let plan_id = handler.list_plans().await.unwrap()[0].id;

        assert!(handler.view_plan(10, plan_id).await.unwrap().can_use_trial);
        handler.activate_trial(10, plan_id).await.unwrap();
        let view = handler.view_plan(10, plan_id).await.unwrap();
        assert!(!view.can_use_trial);
        assert!(!view.has_active_subscription);
    }

    #[tokio::test]
    async fn test_payment_rejections() {
        let handler = handler();
        handler.start(10, &UserProfile::default(), None).await.unwrap();
        let plan_id = handler.list_plans().await.unwrap()[0].id;

        let unknown = handler.initiate_payment(10, plan_id, "SOL").await.unwrap_err();
        assert!(matches!(unknown, EntitlementError::InvalidInput(_)));

        // BSC exists but has no wallet configured
        let unconfigured = handler.initiate_payment(10, plan_id, "BSC").await.unwrap_err();
        assert!(unconfigured.is_rejection());

        let missing_plan = handler.initiate_payment(10, 999, "TRC20").await.unwrap_err();
        assert!(matches!(missing_plan, EntitlementError::NotFound { entity: "Plan", .. }));
    }

    #[tokio::test]
    async fn test_confirm_requires_owner_or_admin() {
        let handler = handler();
        handler.start(10, &UserProfile::default(), None).await.unwrap();
        handler.start(20, &UserProfile::default(), None).await.unwrap();
        let plan_id = handler.list_plans().await.unwrap()[0].id;
        let instructions = handler.initiate_payment(10, plan_id, "trc20").await.unwrap();
        assert_eq!(instructions.wallet_address, "TXwallet");
        let payment_id = instructions.payment.id;

        assert!(matches!(
            handler.confirm_payment(20, payment_id).await,
            Err(EntitlementError::Forbidden(_))
        ));
        assert!(matches!(
            handler.confirm_payment_as_admin(20, payment_id, None).await,
            Err(EntitlementError::Forbidden(_))
        ));

        let activation = handler
            .confirm_payment_as_admin(1, payment_id, Some("0xabc"))
            .await
            .unwrap();
        assert_eq!(activation.gate, GateGrant::Admitted);
        assert_eq!(activation.confirmation.payment.transaction_id.as_deref(), Some("0xabc"));

        let paid_again = handler.initiate_payment(10, plan_id, "TRC20").await.unwrap_err();
        assert!(matches!(paid_again, EntitlementError::AlreadySubscribed { .. }));
    }

    #[tokio::test]
    async fn test_view_subscriptions_includes_plan() {
        let handler = handler();
        handler.start(10, &UserProfile::default(), None).await.unwrap();
        let plan_id = handler.list_plans().await.unwrap()[0].id;
        handler.activate_trial(10, plan_id).await.unwrap();

        let subs = handler.view_subscriptions(10).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].plan.as_ref().map(|p| p.id), Some(plan_id));
    }
}
