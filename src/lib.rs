//! Subgate - subscription and payment lifecycle engine for gated channels
//!
//! Users take a one-time trial or pay for a plan; while their subscription
//! is live they are members of a restricted channel, and when it runs out
//! the expiry sweeper moves it to EXPIRED and removes them.
//!
//! ## Architecture
//!
//! ```text
//! CommandHandler (inbound actions)      ExpirySweeper (interval)
//!         │                                     │
//!         ▼                                     ▼
//! Services: users, plans, lifecycle, payments, referrals
//!         │                                     │
//!         ▼                                     ▼
//! EntitlementStore (SQLite)        AccessGateSynchronizer → GateTransport
//! ```
//!
//! The store is the source of truth. Channel membership is applied after
//! each entitlement change commits and is best-effort.
//!
//! ## Subscription states
//!
//! | From | activate | expire | cancel |
//! |------|----------|--------|--------|
//! | trial | active | expired | cancelled |
//! | active | (no-op) | expired | cancelled |
//! | expired | active | (no-op) | rejected |
//! | cancelled | rejected | rejected | (no-op) |

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod services;
pub mod sweeper;

pub use commands::CommandHandler;
pub use config::Config;
pub use db::EntitlementStore;
pub use error::{EntitlementError, UserFacing};
pub use gate::{AccessGateSynchronizer, GateGrant, GateTransport, GrantMode, TelegramGate};
pub use services::{EntitlementEvent, EventBus, LifecyclePolicy, Services};
pub use sweeper::{ExpirySweeper, SweepReport};
