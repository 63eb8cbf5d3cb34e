//! Configuration for subgate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EntitlementError;
use crate::gate::{GateSettings, GrantMode, TelegramGateConfig};
use crate::services::LifecyclePolicy;

/// Default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("subgate")
        .join("subgate.db")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Free trial length in days (0 disables trials)
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,

    /// Expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// External ids allowed to confirm payments manually
    #[serde(default)]
    pub admin_ids: Vec<i64>,

    /// Log filter directive (e.g. `info`, `subgate=debug`)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub payments: PaymentsConfig,
}

/// Channel gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub bot_token: String,

    /// Numeric chat id or `@channelname`
    #[serde(default)]
    pub channel_id: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default)]
    pub grant_mode: GrantMode,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,

    /// Invite link lifetime in seconds
    #[serde(default = "default_invite_ttl")]
    pub invite_ttl_secs: u64,
}

/// Payment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
}

/// A payment network and the wallet that receives on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Identifier used in commands (e.g. `TRC20`)
    pub name: String,
    /// Human readable label (e.g. `USDT (TRC20)`)
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub wallet_address: String,
}

fn default_trial_days() -> u32 {
    7
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_gate_timeout_ms() -> u64 {
    10_000
}

fn default_invite_ttl() -> u64 {
    86_400
}

fn default_provider() -> String {
    "manual".to_string()
}

fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig {
            name: "TRC20".to_string(),
            label: "USDT (TRC20)".to_string(),
            wallet_address: String::new(),
        },
        NetworkConfig {
            name: "BSC".to_string(),
            label: "USDT (BEP20)".to_string(),
            wallet_address: String::new(),
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            trial_days: default_trial_days(),
            sweep_interval_secs: default_sweep_interval(),
            admin_ids: Vec::new(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            gate: GateConfig::default(),
            payments: PaymentsConfig::default(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            channel_id: String::new(),
            api_base: default_api_base(),
            grant_mode: GrantMode::default(),
            timeout_ms: default_gate_timeout_ms(),
            invite_ttl_secs: default_invite_ttl(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            networks: default_networks(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Check settings needed to talk to the channel
    pub fn validate(&self, require_gate: bool) -> Result<(), EntitlementError> {
        if require_gate {
            if self.gate.bot_token.trim().is_empty() {
                return Err(EntitlementError::Config("gate.bot_token (BOT_TOKEN) is required".into()));
            }
            if self.gate.channel_id.trim().is_empty() {
                return Err(EntitlementError::Config("gate.channel_id (CHANNEL_ID) is required".into()));
            }
        }
        if self.sweep_interval_secs == 0 {
            return Err(EntitlementError::Config("sweep_interval_secs must be positive".into()));
        }
        if self.gate.timeout_ms == 0 {
            return Err(EntitlementError::Config("gate.timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn is_admin(&self, external_id: i64) -> bool {
        self.admin_ids.contains(&external_id)
    }

    /// Network by name, case-insensitive
    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.payments
            .networks
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// Set the wallet for `name`, adding the network if unknown
    pub fn set_wallet(&mut self, name: &str, wallet_address: String) {
        let networks = &mut self.payments.networks;
        if let Some(network) = networks.iter_mut().find(|n| n.name.eq_ignore_ascii_case(name)) {
            network.wallet_address = wallet_address;
            return;
        }
        networks.push(NetworkConfig {
            name: name.to_string(),
            label: name.to_string(),
            wallet_address,
        });
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            trial_days: self.trial_days,
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            grant_mode: self.gate.grant_mode,
            call_timeout: Duration::from_millis(self.gate.timeout_ms),
            invite_ttl: Duration::from_secs(self.gate.invite_ttl_secs),
        }
    }

    pub fn telegram(&self) -> TelegramGateConfig {
        TelegramGateConfig {
            api_base: self.gate.api_base.clone(),
            bot_token: self.gate.bot_token.clone(),
            channel_id: self.gate.channel_id.clone(),
            request_timeout: Duration::from_millis(self.gate.timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse a comma separated id list such as `ADMIN_USER_IDS`
pub fn parse_id_list(raw: &str) -> Result<Vec<i64>, EntitlementError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| EntitlementError::Config(format!("invalid user id in list: {s}")))
        })
        .collect()
}
