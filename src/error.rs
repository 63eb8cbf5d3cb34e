//! Error types for subgate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("User {user_id} already has a live subscription")]
    AlreadySubscribed { user_id: i64 },

    #[error("Payment {payment_id} already completed")]
    AlreadyCompleted { payment_id: i64 },

    #[error("Free trial already used by user {user_id}")]
    TrialUnavailable { user_id: i64 },

    #[error("Plan {plan_id} is not offered")]
    PlanUnavailable { plan_id: i64 },

    #[error("Cannot {action} {entity} in state {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Gate error: {0}")]
    ExternalGate(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an error should be presented to the person who triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFacing {
    /// Expected refusal with a reason the user can act on
    Rejected(String),
    /// Unexpected failure; details stay in the server log
    TryAgain,
}

impl EntitlementError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify for the inbound command surface.
    pub fn user_facing(&self) -> UserFacing {
        match self {
            Self::NotFound { entity, .. } => UserFacing::Rejected(format!("{entity} not found")),
            Self::AlreadySubscribed { .. } => {
                UserFacing::Rejected("You already have an active subscription".into())
            }
            Self::AlreadyCompleted { .. } => {
                UserFacing::Rejected("This payment has already been confirmed".into())
            }
            Self::TrialUnavailable { .. } => {
                UserFacing::Rejected("The free trial has already been used".into())
            }
            Self::PlanUnavailable { .. } => {
                UserFacing::Rejected("This plan is no longer available".into())
            }
            Self::Forbidden(_) => {
                UserFacing::Rejected("You are not allowed to perform this action".into())
            }
            Self::InvalidInput(reason) => UserFacing::Rejected(reason.clone()),
            Self::InvalidTransition { .. } => {
                UserFacing::Rejected("This action is not possible in the current state".into())
            }
            Self::Conflict(_)
            | Self::ExternalGate(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::Internal(_) => UserFacing::TryAgain,
        }
    }

    /// Whether the error reflects a user-caused refusal rather than a fault
    pub fn is_rejection(&self) -> bool {
        matches!(self.user_facing(), UserFacing::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_carry_reason() {
        let err = EntitlementError::AlreadySubscribed { user_id: 4 };
        assert!(err.is_rejection());
        assert_eq!(
            err.user_facing(),
            UserFacing::Rejected("You already have an active subscription".into())
        );

        let err = EntitlementError::not_found("Plan", 9);
        assert_eq!(err.to_string(), "Plan not found: 9");
        assert_eq!(err.user_facing(), UserFacing::Rejected("Plan not found".into()));
    }

    #[test]
    fn test_faults_become_try_again() {
        let err = EntitlementError::Internal("lock poisoned".into());
        assert_eq!(err.user_facing(), UserFacing::TryAgain);
        assert!(!EntitlementError::Conflict("dup".into()).is_rejection());
    }
}
