//! Service layer for subgate
//!
//! Services hold the business rules between the command surface and the
//! store. Each service wraps repository calls with:
//! - Input validation
//! - Transaction boundaries
//! - Event emission after commit
//!
//! ## Architecture
//!
//! ```text
//! CommandHandler / ExpirySweeper
//!     ↓
//! Service Layer (lifecycle, payments, referrals)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod payment_service;
pub mod plan_service;
pub mod referral_service;
pub mod subscription_service;
pub mod user_service;

// Re-exports
pub use events::{spawn_audit_listener, EntitlementEvent, EventBus, EventListener};
pub use payment_service::{Confirmation, PaymentRequest, PaymentService};
pub use plan_service::PlanService;
pub use referral_service::{ReferralService, ReferralStats, REFERRAL_POINTS};
pub use subscription_service::{LifecyclePolicy, SubscriptionService, TransitionOutcome};
pub use user_service::{Registration, UserService};

use crate::db::EntitlementStore;
use std::sync::Arc;

/// Service container for dependency injection
///
/// All services share one store and one event bus.
pub struct Services {
    pub users: Arc<UserService>,
    pub plans: Arc<PlanService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub payments: Arc<PaymentService>,
    pub referrals: Arc<ReferralService>,
    pub events: Arc<EventBus>,
    pub store: Arc<EntitlementStore>,
}

impl Services {
    pub fn new(store: Arc<EntitlementStore>, policy: LifecyclePolicy) -> Self {
        Self::with_events(store, policy, Arc::new(EventBus::new()))
    }

    /// Create services publishing to an existing event bus
    pub fn with_events(store: Arc<EntitlementStore>, policy: LifecyclePolicy, events: Arc<EventBus>) -> Self {
        Self {
            users: Arc::new(UserService::new(store.clone(), events.clone())),
            plans: Arc::new(PlanService::new(store.clone())),
            subscriptions: Arc::new(SubscriptionService::new(store.clone(), events.clone(), policy)),
            payments: Arc::new(PaymentService::new(store.clone(), events.clone(), policy)),
            referrals: Arc::new(ReferralService::new(store.clone(), events.clone())),
            events,
            store,
        }
    }
}
