//! Event system for entitlement changes
//!
//! Services emit one event per committed state change. Listeners never
//! influence the change itself; the bus is an audit/notification side
//! channel.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Entitlement events emitted by services and the gate synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum EntitlementEvent {
    UserCreated {
        user_id: i64,
        external_id: i64,
    },
    ReferralRecorded {
        referrer_id: i64,
        referred_id: i64,
        points: i64,
    },
    TrialConsumed {
        user_id: i64,
        subscription_id: i64,
    },

    // Subscription lifecycle
    SubscriptionCreated {
        subscription_id: i64,
        user_id: i64,
        plan_id: i64,
        is_trial: bool,
    },
    SubscriptionActivated {
        subscription_id: i64,
        user_id: i64,
    },
    SubscriptionExpired {
        subscription_id: i64,
        user_id: i64,
    },
    SubscriptionCancelled {
        subscription_id: i64,
        user_id: i64,
    },

    // Payments
    PaymentCreated {
        payment_id: i64,
        user_id: i64,
        plan_id: i64,
    },
    PaymentConfirmed {
        payment_id: i64,
        user_id: i64,
        subscription_id: i64,
    },
    PaymentFailed {
        payment_id: i64,
    },
    PaymentRefunded {
        payment_id: i64,
    },

    // Gate
    GateGranted {
        external_id: i64,
    },
    GateRevoked {
        external_id: i64,
    },
    GateFailed {
        external_id: i64,
        operation: &'static str,
        reason: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EntitlementEvent);
}

/// Event bus for broadcasting entitlement events
pub struct EventBus {
    sender: broadcast::Sender<EntitlementEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EntitlementEvent) {
        trace!(event = ?event, "Emitting entitlement event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the audit trail to the log
pub struct AuditLogListener;

impl EventListener for AuditLogListener {
    fn on_event(&self, event: &EntitlementEvent) {
        match event {
            EntitlementEvent::SubscriptionCreated {
                subscription_id,
                user_id,
                is_trial,
                ..
            } => {
                info!(subscription_id, user_id, is_trial, "audit: subscription created");
            }
            EntitlementEvent::SubscriptionActivated { subscription_id, user_id } => {
                info!(subscription_id, user_id, "audit: subscription activated");
            }
            EntitlementEvent::SubscriptionExpired { subscription_id, user_id } => {
                info!(subscription_id, user_id, "audit: subscription expired");
            }
            EntitlementEvent::PaymentConfirmed {
                payment_id,
                user_id,
                subscription_id,
            } => {
                info!(payment_id, user_id, subscription_id, "audit: payment confirmed");
            }
            EntitlementEvent::GateFailed {
                external_id,
                operation,
                reason,
            } => {
                warn!(external_id, operation, reason = %reason, "audit: gate operation failed");
            }
            _ => {
                debug!(event = ?event, "audit");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_audit_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = AuditLogListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Audit listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping audit listener");
                    break;
                }
            }
        }
    })
}
