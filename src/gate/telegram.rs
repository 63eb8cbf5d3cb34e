//! Telegram Bot API gate transport
//!
//! Calls `unbanChatMember`, `banChatMember`, `createChatInviteLink` and
//! `getChatMember` on the configured channel. The bot token is part of the
//! request URL, so transport errors are stripped of their URL before being
//! surfaced.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{GateError, GateTransport, MemberStatus};

/// Configuration for the Telegram transport
#[derive(Debug, Clone)]
pub struct TelegramGateConfig {
    /// Bot API base URL (default: https://api.telegram.org)
    pub api_base: String,
    pub bot_token: String,
    /// Numeric chat id (`-100...`) or `@channelname`
    pub channel_id: String,
    /// Timeout for HTTP requests (default: 10 seconds)
    pub request_timeout: Duration,
}

impl Default for TelegramGateConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            channel_id: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Bot API response envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, GateError> {
        if !self.ok {
            return Err(GateError::Api {
                code: self.error_code,
                description: self.description.unwrap_or_else(|| "unknown error".into()),
            });
        }
        self.result
            .ok_or_else(|| GateError::Decode("ok response without result".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: MemberStatus,
}

#[derive(Debug, Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

pub struct TelegramGate {
    config: TelegramGateConfig,
    http_client: reqwest::Client,
}

impl TelegramGate {
    pub fn new(config: TelegramGateConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("subgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self { config, http_client }
    }

    /// Numeric ids are sent as numbers, usernames as strings
    fn chat_id(&self) -> Value {
        match self.config.channel_id.parse::<i64>() {
            Ok(id) => json!(id),
            Err(_) => json!(self.config.channel_id),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, GateError> {
        let url = format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        );
        debug!(method, "Calling Bot API");

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Transport(e.without_url().to_string()))?;

        // Error responses carry the same envelope, so decode regardless of status
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| GateError::Decode(e.without_url().to_string()))?;
        envelope.into_result()
    }
}

#[async_trait]
impl GateTransport for TelegramGate {
    async fn unban(&self, external_id: i64, only_if_banned: bool) -> Result<(), GateError> {
        let _: bool = self
            .call(
                "unbanChatMember",
                json!({
                    "chat_id": self.chat_id(),
                    "user_id": external_id,
                    "only_if_banned": only_if_banned,
                }),
            )
            .await?;
        Ok(())
    }

    async fn ban(&self, external_id: i64) -> Result<(), GateError> {
        let _: bool = self
            .call(
                "banChatMember",
                json!({ "chat_id": self.chat_id(), "user_id": external_id }),
            )
            .await?;
        Ok(())
    }

    async fn create_invite_link(&self, expire_at: DateTime<Utc>) -> Result<String, GateError> {
        let link: ChatInviteLink = self
            .call(
                "createChatInviteLink",
                json!({
                    "chat_id": self.chat_id(),
                    "expire_date": expire_at.timestamp(),
                    "member_limit": 1,
                }),
            )
            .await?;
        Ok(link.invite_link)
    }

    async fn member_status(&self, external_id: i64) -> Result<MemberStatus, GateError> {
        let member: ChatMember = self
            .call(
                "getChatMember",
                json!({ "chat_id": self.chat_id(), "user_id": external_id }),
            )
            .await?;
        Ok(member.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(channel_id: &str) -> TelegramGate {
        TelegramGate::new(TelegramGateConfig {
            bot_token: "123:abc".into(),
            channel_id: channel_id.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_chat_id_numeric_or_username() {
        assert_eq!(gate("-1001234567890").chat_id(), json!(-1001234567890i64));
        assert_eq!(gate("@premium_channel").chat_id(), json!("@premium_channel"));
    }

    #[test]
    fn test_error_envelope() {
        let raw = r#"{"ok":false,"error_code":400,"description":"Bad Request: PARTICIPANT_ID_INVALID"}"#;
        let envelope: ApiResponse<bool> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            envelope.into_result(),
            Err(GateError::Api {
                code: Some(400),
                description: "Bad Request: PARTICIPANT_ID_INVALID".into(),
            })
        );
    }

    #[test]
    fn test_member_envelope() {
        let raw = r#"{"ok":true,"result":{"status":"kicked","user":{"id":5,"is_bot":false,"first_name":"A"}}}"#;
        let envelope: ApiResponse<ChatMember> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.into_result().unwrap().status, MemberStatus::Kicked);
    }

    #[test]
    fn test_invite_envelope() {
        let raw = r#"{"ok":true,"result":{"invite_link":"https://t.me/+XyZ","member_limit":1,"creates_join_request":false}}"#;
        let envelope: ApiResponse<ChatInviteLink> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.into_result().unwrap().invite_link, "https://t.me/+XyZ");
    }
}
