//! HMS Billing CLI
//!
//! Operator interface to the billing engine. State lives in a JSON file
//! (`~/.hms-billing/state.json` unless configured otherwise).
//!
//! # Usage
//!
//! ```bash
//! hms-billing catalog import -f catalog.yaml
//! hms-billing subscriptions create --tenant <id> --plan <id> --cycle monthly
//! hms-billing usage record <subscription> --entity lab-order --units 3
//! hms-billing invoices generate <subscription> --discount WELCOME
//! hms-billing subscriptions sweep --watch
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use hms_billing::{BillingCycle, BillingStatus};

mod commands;
mod config;
mod output;
mod session;

#[derive(Parser)]
#[command(name = "hms-billing")]
#[command(version)]
#[command(about = "HMS subscription lifecycle and metered billing", long_about = None)]
struct Cli {
    /// State file
    #[arg(long, env = "HMS_BILLING_STATE")]
    state: Option<PathBuf>,

    /// Output format
    #[arg(long, short)]
    format: Option<output::OutputFormat>,

    /// Profile name from config file
    #[arg(long, short, env = "HMS_BILLING_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and evaluate pricing rules
    Rules {
        #[command(subcommand)]
        action: RuleCommands,
    },
    /// Manage subscriptions
    Subscriptions {
        #[command(subcommand)]
        action: SubscriptionCommands,
    },
    /// Record and inspect usage
    Usage {
        #[command(subcommand)]
        action: UsageCommands,
    },
    /// Manage invoices
    Invoices {
        #[command(subcommand)]
        action: InvoiceCommands,
    },
    /// Load plans, entities, rules and discount codes
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
    /// Configure CLI
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Validate a rule file (JSON or YAML)
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Evaluate a rule file against a unit count
    Evaluate {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        units: Decimal,
        #[arg(long)]
        complexity: Option<String>,
        /// Base amount for percentage rules
        #[arg(long, default_value = "0")]
        basis: Decimal,
    },
}

#[derive(Subcommand)]
enum SubscriptionCommands {
    /// Start a subscription (supersedes the tenant's live one)
    Create {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        plan: Uuid,
        #[arg(long, default_value = "monthly")]
        cycle: BillingCycle,
        #[arg(long)]
        trial: bool,
        #[arg(long)]
        no_auto_renew: bool,
    },
    /// Convert a trial to paid
    Activate { id: Uuid },
    /// Move to a higher tier now, prorated
    Upgrade {
        id: Uuid,
        #[arg(long)]
        plan: Uuid,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Move to a lower tier at the next renewal
    Downgrade {
        id: Uuid,
        #[arg(long)]
        plan: Uuid,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Cancel
    Cancel {
        id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Renew by one cycle
    Renew { id: Uuid },
    /// Turn auto-renew on or off
    AutoRenew {
        id: Uuid,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Subscription details, change history and pending downgrade
    Show { id: Uuid },
    /// Expire or renew due subscriptions and flag overdue invoices
    Sweep {
        /// Keep sweeping every `sweep_interval_secs`
        #[arg(long)]
        watch: bool,
        /// Override the configured interval
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Monthly and annual recurring revenue
    Revenue,
}

#[derive(Subcommand)]
enum UsageCommands {
    /// Record usage
    Record {
        subscription: Uuid,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        units: Decimal,
        #[arg(long)]
        complexity: Option<String>,
        /// Idempotency key
        #[arg(long)]
        key: Option<String>,
    },
    /// Units per entity over a window
    Summary {
        subscription: Uuid,
        /// Defaults to the current period start
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Defaults to the current period end
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// unbilled | billed | invoiced (repeatable)
        #[arg(long)]
        status: Vec<BillingStatus>,
    },
    /// Unresolved alerts
    Alerts { subscription: Uuid },
    /// Resolve an alert
    Resolve { id: Uuid },
}

#[derive(Subcommand)]
enum InvoiceCommands {
    /// Generate a draft invoice
    Generate {
        subscription: Uuid,
        /// Defaults to the current period start
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Defaults to the current period end
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        discount: Option<String>,
    },
    /// Send a draft
    Finalize { id: Uuid },
    /// Record payment
    Pay { id: Uuid },
    /// Cancel
    Cancel { id: Uuid },
    /// Invoice with line items
    Show { id: Uuid },
    /// Invoices of a subscription
    List { subscription: Uuid },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Import a catalog bundle (JSON or YAML)
    Import {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = config::Config::load(cli.profile.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config not loaded, using defaults");
        config::Config::default()
    });
    let format = cli.format.or_else(|| config.format()).unwrap_or(output::OutputFormat::Table);
    let state_path = cli.state.clone().or_else(|| config.state_path.clone());

    let ctx = commands::Context {
        config,
        profile: cli.profile,
        state_path,
        format,
    };

    let result = match cli.command {
        Commands::Rules { action } => commands::rules::handle(action, &ctx),
        Commands::Subscriptions { action } => commands::subscriptions::handle(action, &ctx).await,
        Commands::Usage { action } => commands::usage::handle(action, &ctx),
        Commands::Invoices { action } => commands::invoices::handle(action, &ctx),
        Commands::Catalog { action } => commands::catalog::handle(action, &ctx),
        Commands::Config { action } => commands::config::handle(action, &ctx),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
