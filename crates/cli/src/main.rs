//! Coachflow CLI: the main entry point.
//!
//! Commands:
//! - `onboard`: write a default config file
//! - `daemon`:  run the scheduler loop and the HTTP gateway
//! - `tick`:    run one scheduler tick and print the report
//! - `fire`:    feed one event through the rule engine
//! - `enroll`:  enroll a user in a sequence
//! - `tag`:     add or remove a user tag
//! - `status`:  show configuration and store counts

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "coachflow",
    about = "Coachflow: drip sequences, coach DMs, and tag rules for learning platforms",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to ~/.coachflow/config.toml)
    #[arg(short, long, global = true, env = "COACHFLOW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Onboard {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run the scheduler loop and the HTTP gateway
    Daemon {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve the API without the periodic scheduler
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run a single scheduler tick
    Tick {
        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Send one event through the workflow rules
    Fire {
        user_id: String,
        trigger: String,

        /// Event payload as a JSON object
        #[arg(short, long)]
        payload: Option<String>,

        /// Idempotency key for rule actions
        #[arg(long)]
        dedupe_key: Option<String>,
    },

    /// Enroll a user in a sequence
    Enroll { user_id: String, sequence_id: String },

    /// Add, update, or remove a user tag
    Tag {
        user_id: String,
        key: String,
        value: Option<String>,

        /// Remove the tag instead of setting it
        #[arg(long, conflicts_with = "value")]
        remove: bool,
    },

    /// Show configuration and store counts
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Onboard { force } => commands::onboard::run(config_path, force).await?,
        Commands::Daemon { port, no_scheduler } => {
            commands::daemon::run(config_path, port, no_scheduler).await?
        }
        Commands::Tick { at } => commands::tick::run(config_path, at).await?,
        Commands::Fire {
            user_id,
            trigger,
            payload,
            dedupe_key,
        } => commands::fire::run(config_path, &user_id, &trigger, payload, dedupe_key).await?,
        Commands::Enroll {
            user_id,
            sequence_id,
        } => commands::enroll::run(config_path, &user_id, &sequence_id).await?,
        Commands::Tag {
            user_id,
            key,
            value,
            remove,
        } => commands::tag::run(config_path, &user_id, &key, value.as_deref(), remove).await?,
        Commands::Status => commands::status::run(config_path).await?,
    }

    Ok(())
}
