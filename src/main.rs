//! Subgate daemon
//!
//! Hosts the entitlement engine and the expiry sweeper for one gated channel.
//!
//! ## Usage
//!
//! ```bash
//! # Run the sweeper loop (default)
//! BOT_TOKEN=123:abc CHANNEL_ID=-100123 subgate
//!
//! # Custom config and database
//! subgate --config /etc/subgate.toml --db-path /var/lib/subgate/subgate.db serve
//!
//! # Insert the default plan catalog
//! subgate seed-plans
//!
//! # Run a single sweep and print the report
//! subgate sweep
//!
//! # Confirm a payment by hand
//! subgate confirm-payment 42 --tx 0xabc --admin 123456
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use subgate::config::parse_id_list;
use subgate::{
    AccessGateSynchronizer, CommandHandler, Config, EntitlementStore, ExpirySweeper, Services,
    TelegramGate,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "subgate")]
#[command(about = "Subscription lifecycle engine for a gated channel")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SUBGATE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "SUBGATE_DB")]
    db_path: Option<PathBuf>,

    /// Bot API token
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    bot_token: Option<String>,

    /// Gated channel id
    #[arg(long, env = "CHANNEL_ID")]
    channel_id: Option<String>,

    /// Free trial length in days
    #[arg(long, env = "FREE_TRIAL_DAYS")]
    trial_days: Option<u32>,

    /// Comma separated admin user ids
    #[arg(long, env = "ADMIN_USER_IDS")]
    admin_ids: Option<String>,

    /// Wallet receiving USDT on TRC20
    #[arg(long, env = "USDT_TRC20_ADDRESS")]
    usdt_trc20_address: Option<String>,

    /// Wallet receiving USDT on BSC
    #[arg(long, env = "USDT_BSC_ADDRESS")]
    usdt_bsc_address: Option<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output: pretty or json
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the expiry sweeper until interrupted
    Serve,
    /// Insert the default plans when the catalog is empty
    SeedPlans,
    /// Run one expiry sweep and print the report
    Sweep,
    /// Print database statistics
    Stats,
    /// Confirm a payment as an administrator
    ConfirmPayment {
        payment_id: i64,
        /// On-chain transaction id
        #[arg(long)]
        tx: Option<String>,
        /// Admin user id performing the confirmation
        #[arg(long)]
        admin: i64,
    },
}

impl Command {
    fn needs_gate(&self) -> bool {
        matches!(self, Command::Serve | Command::Sweep | Command::ConfirmPayment { .. })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) if path.exists() => Config::load(path)?,
        _ => Config::default(),
    };
    apply_overrides(&mut config, &args)?;

    init_tracing(&config)?;

    let command = args.command.unwrap_or(Command::Serve);
    config.validate(command.needs_gate())?;

    info!(
        database = %config.database_path.display(),
        trial_days = config.trial_days,
        command = ?command,
        "Starting subgate"
    );

    let store = Arc::new(EntitlementStore::open(&config.database_path)?);
    let services = Arc::new(Services::new(store.clone(), config.lifecycle_policy()));

    let gate = Arc::new(AccessGateSynchronizer::new(
        Arc::new(TelegramGate::new(config.telegram())),
        services.events.clone(),
        config.gate_settings(),
    ));
    let sweeper = Arc::new(
        ExpirySweeper::new(services.subscriptions.clone(), services.users.clone(), gate.clone())
            .with_interval(config.sweep_interval()),
    );

    match command {
        Command::Serve => {
            let seeded = services.plans.seed_defaults()?;
            if seeded > 0 {
                info!(count = seeded, "Initialized plan catalog");
            }
            for network in &config.payments.networks {
                if network.wallet_address.is_empty() {
                    warn!(network = %network.name, "No wallet configured, payments on this network are disabled");
                }
            }

            let stats = store.stats()?;
            info!(
                users = stats.users,
                live_subscriptions = stats.live_subscriptions,
                pending_payments = stats.pending_payments,
                "Entitlement store ready"
            );

            let audit = subgate::services::spawn_audit_listener(services.events.clone());
            sweeper.clone().start().await;

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            sweeper.stop().await;
            audit.abort();
        }
        Command::SeedPlans => {
            let seeded = services.plans.seed_defaults()?;
            println!("Seeded {} plan(s)", seeded);
        }
        Command::Sweep => {
            let report = sweeper.sweep().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats()?)?);
        }
        Command::ConfirmPayment {
            payment_id,
            tx,
            admin,
        } => {
            let handler = CommandHandler::new(services.clone(), gate.clone(), Arc::new(config.clone()));
            let activation = handler
                .confirm_payment_as_admin(admin, payment_id, tx.as_deref())
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "payment": activation.confirmation.payment,
                    "subscription": activation.confirmation.subscription,
                    "created_subscription": activation.confirmation.created_subscription,
                    "channel_access": activation.gate.succeeded(),
                    "invite_link": activation.gate.invite_link(),
                }))?
            );
        }
    }

    Ok(())
}

/// CLI flags and environment take precedence over the config file
fn apply_overrides(config: &mut Config, args: &Args) -> anyhow::Result<()> {
    if let Some(path) = &args.db_path {
        config.database_path = path.clone();
    }
    if let Some(token) = &args.bot_token {
        config.gate.bot_token = token.clone();
    }
    if let Some(channel) = &args.channel_id {
        config.gate.channel_id = channel.clone();
    }
    if let Some(days) = args.trial_days {
        config.trial_days = days;
    }
    if let Some(ids) = &args.admin_ids {
        config.admin_ids = parse_id_list(ids)?;
    }
    if let Some(address) = &args.usdt_trc20_address {
        config.set_wallet("TRC20", address.clone());
    }
    if let Some(address) = &args.usdt_bsc_address {
        config.set_wallet("BSC", address.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.log_format = format.clone();
    }
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        "pretty" => tracing_subscriber::fmt().with_env_filter(filter).init(),
        other => anyhow::bail!("unknown log_format: {other} (expected pretty or json)"),
    }
    Ok(())
}
