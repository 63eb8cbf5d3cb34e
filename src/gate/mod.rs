//! Access gate synchronizer
//!
//! Reflects entitlement state into the gated channel's membership. Gate calls
//! are made only after the entitlement change has committed and their
//! failure never flows back into it: every error or timeout is logged,
//! published as [`EntitlementEvent::GateFailed`], and reported as a
//! non-fatal result.
//!
//! The raw platform operations live behind [`GateTransport`]; [`TelegramGate`]
//! is the production transport.

pub mod telegram;

pub use telegram::{TelegramGate, TelegramGateConfig};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::EntitlementError;
use crate::services::events::{EntitlementEvent, EventBus};

/// Gate transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Platform rejected request ({code:?}): {description}")]
    Api { code: Option<i64>, description: String },

    #[error("Malformed platform response: {0}")]
    Decode(String),

    #[error("Gate call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<GateError> for EntitlementError {
    fn from(e: GateError) -> Self {
        EntitlementError::ExternalGate(e.to_string())
    }
}

/// Membership state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    /// Whether the user can currently read the channel
    pub fn is_member(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

/// Raw gate operations against the messaging platform
#[async_trait]
pub trait GateTransport: Send + Sync {
    /// Lift a ban. With `only_if_banned` an existing member is left in place.
    async fn unban(&self, external_id: i64, only_if_banned: bool) -> Result<(), GateError>;

    async fn ban(&self, external_id: i64) -> Result<(), GateError>;

    /// Create a single-use invite link expiring at `expire_at`
    async fn create_invite_link(&self, expire_at: chrono::DateTime<Utc>) -> Result<String, GateError>;

    async fn member_status(&self, external_id: i64) -> Result<MemberStatus, GateError>;
}

/// How access is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantMode {
    /// Lift any ban; the user joins the public channel on their own
    #[default]
    Unban,
    /// Lift any ban and hand the user a single-use invite link
    InviteLink,
}

/// Result of a grant attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateGrant {
    Admitted,
    Invited { invite_link: String },
    Failed { reason: String },
}

impl GateGrant {
    pub fn succeeded(&self) -> bool {
        !matches!(self, GateGrant::Failed { .. })
    }

    pub fn invite_link(&self) -> Option<&str> {
        match self {
            GateGrant::Invited { invite_link } => Some(invite_link),
            _ => None,
        }
    }
}

/// Synchronizer settings
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub grant_mode: GrantMode,
    /// Upper bound for each platform call
    pub call_timeout: Duration,
    /// Lifetime of generated invite links
    pub invite_ttl: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            grant_mode: GrantMode::Unban,
            call_timeout: Duration::from_secs(10),
            invite_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Bridges entitlement changes to channel membership
pub struct AccessGateSynchronizer {
    transport: Arc<dyn GateTransport>,
    events: Arc<EventBus>,
    settings: GateSettings,
}

impl AccessGateSynchronizer {
    pub fn new(transport: Arc<dyn GateTransport>, events: Arc<EventBus>, settings: GateSettings) -> Self {
        Self {
            transport,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Admit `external_id` to the channel. Safe to repeat.
    pub async fn grant(&self, external_id: i64) -> GateGrant {
        let grant = match self.settings.grant_mode {
            GrantMode::Unban => self
                .bounded(self.transport.unban(external_id, true))
                .await
                .map(|()| GateGrant::Admitted),
            GrantMode::InviteLink => {
                // Not being banned is the common case
                if let Err(e) = self.bounded(self.transport.unban(external_id, true)).await {
                    debug!(external_id, error = %e, "Pre-invite unban failed, continuing");
                }
                let ttl = chrono::Duration::from_std(self.settings.invite_ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                self.bounded(self.transport.create_invite_link(Utc::now() + ttl))
                    .await
                    .map(|invite_link| GateGrant::Invited { invite_link })
            }
        };

        match grant {
            Ok(grant) => {
                info!(external_id, mode = ?self.settings.grant_mode, "Granted channel access");
                self.events.emit(EntitlementEvent::GateGranted { external_id });
                grant
            }
            Err(e) => {
                self.report_failure(external_id, "grant", &e);
                GateGrant::Failed { reason: e.to_string() }
            }
        }
    }

    /// Remove `external_id` from the channel. Returns false on failure.
    pub async fn revoke(&self, external_id: i64) -> bool {
        match self.bounded(self.transport.ban(external_id)).await {
            Ok(()) => {
                info!(external_id, "Revoked channel access");
                self.events.emit(EntitlementEvent::GateRevoked { external_id });
                true
            }
            Err(e) => {
                self.report_failure(external_id, "revoke", &e);
                false
            }
        }
    }

    /// Whether `external_id` is currently in the channel. Unknown is false.
    pub async fn is_member(&self, external_id: i64) -> bool {
        match self.bounded(self.transport.member_status(external_id)).await {
            Ok(status) => status.is_member(),
            Err(e) => {
                warn!(external_id, error = %e, "Membership check failed");
                false
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, GateError>>,
    ) -> Result<T, GateError> {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GateError::Timeout(self.settings.call_timeout)),
        }
    }

    fn report_failure(&self, external_id: i64, operation: &'static str, error: &GateError) {
        warn!(external_id, operation, error = %error, "Gate operation failed");
        self.events.emit(EntitlementEvent::GateFailed {
            external_id,
            operation,
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedGate {
        calls: Mutex<Vec<String>>,
        fail_unban: bool,
        fail_ban: bool,
        hang: bool,
    }

    impl ScriptedGate {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    #[async_trait]
    impl GateTransport for ScriptedGate {
        async fn unban(&self, external_id: i64, only_if_banned: bool) -> Result<(), GateError> {
            self.record(format!("unban:{external_id}:{only_if_banned}")).await;
            if self.fail_unban {
                return Err(GateError::Api {
                    code: Some(400),
                    description: "Bad Request: user not found".into(),
                });
            }
            Ok(())
        }

        async fn ban(&self, external_id: i64) -> Result<(), GateError> {
            self.record(format!("ban:{external_id}")).await;
            if self.fail_ban {
                return Err(GateError::Transport("connection reset".into()));
            }
            Ok(())
        }

        async fn create_invite_link(&self, _expire_at: chrono::DateTime<Utc>) -> Result<String, GateError> {
            self.record("invite".into()).await;
            Ok("https://t.me/+abc123".into())
        }

        async fn member_status(&self, external_id: i64) -> Result<MemberStatus, GateError> {
            self.record(format!("status:{external_id}")).await;
            Ok(MemberStatus::Member)
        }
    }

    fn synchronizer(gate: Arc<ScriptedGate>, mode: GrantMode) -> (AccessGateSynchronizer, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let settings = GateSettings {
            grant_mode: mode,
            call_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        (AccessGateSynchronizer::new(gate, events.clone(), settings), events)
    }

    #[tokio::test]
    async fn test_unban_grant() {
        let gate = Arc::new(ScriptedGate::default());
        let (sync, _) = synchronizer(gate.clone(), GrantMode::Unban);

        assert_eq!(sync.grant(42).await, GateGrant::Admitted);
        assert_eq!(gate.calls(), vec!["unban:42:true".to_string()]);
    }

    #[tokio::test]
    async fn test_invite_grant_tolerates_unban_failure() {
        let gate = Arc::new(ScriptedGate {
            fail_unban: true,
            ..Default::default()
        });
        let (sync, _) = synchronizer(gate.clone(), GrantMode::InviteLink);

        let grant = sync.grant(7).await;
        assert!(grant.succeeded());
        assert_eq!(grant.invite_link(), Some("https://t.me/+abc123"));
        assert_eq!(gate.calls(), vec!["unban:7:true".to_string(), "invite".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_failure_is_reported() {
        let gate = Arc::new(ScriptedGate {
            fail_ban: true,
            ..Default::default()
        });
        let (sync, events) = synchronizer(gate, GrantMode::Unban);
        let mut rx = events.subscribe();

        assert!(!sync.revoke(9).await);
        match rx.recv().await.unwrap() {
            EntitlementEvent::GateFailed {
                external_id,
                operation,
                ..
            } => {
                assert_eq!(external_id, 9);
                assert_eq!(operation, "revoke");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hanging_gate_times_out() {
        let gate = Arc::new(ScriptedGate {
            hang: true,
            ..Default::default()
        });
        let (sync, _) = synchronizer(gate, GrantMode::Unban);

        match sync.grant(3).await {
            GateGrant::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected grant: {other:?}"),
        }
        assert!(!sync.revoke(3).await);
        assert!(!sync.is_member(3).await);
    }

    #[test]
    fn test_member_status_membership() {
        assert!(MemberStatus::Creator.is_member());
        assert!(MemberStatus::Member.is_member());
        assert!(!MemberStatus::Restricted.is_member());
        assert!(!MemberStatus::Kicked.is_member());
    }
}
