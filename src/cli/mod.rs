use clap::{Parser, Subcommand};
use session_relay::config::{default_config_path, RelayConfig};
use session_relay::persistence::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

pub mod init_config;
pub mod instances;
pub mod logging;
pub mod version;
pub mod webhook;

#[derive(Parser)]
#[command(name = "session-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the session relay", long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.config/session-relay/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List persisted instances
    Instances,

    /// Set or clear the webhook URL of a persisted instance
    SetWebhook {
        /// Instance id
        instance: String,

        /// Webhook URL (http or https)
        #[arg(long, conflicts_with = "clear")]
        url: Option<String>,

        /// Remove the webhook URL
        #[arg(long)]
        clear: bool,
    },

    /// Send a webhook.test event to a URL and wait for the delivery chain
    WebhookTest {
        /// Target URL
        url: String,
    },

    /// Re-send a logged delivery under a new delivery id
    WebhookRetry {
        /// Delivery id from `webhook-logs`
        delivery_id: String,
    },

    /// Show webhook delivery logs, newest first
    WebhookLogs {
        /// Only deliveries for this instance
        #[arg(long)]
        instance: Option<String>,

        /// Only this event name (e.g. session.status)
        #[arg(long)]
        event: Option<String>,

        /// Only this outcome (success or failed)
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show delivery statistics by event and outcome
    WebhookStats {
        /// Only deliveries for this instance
        #[arg(long)]
        instance: Option<String>,

        /// Window size in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match cli.command {
        Commands::InitConfig { force } => init_config::execute(&config_path, force),
        Commands::Version => {
            version::execute();
            Ok(())
        }
        command => {
            let config = RelayConfig::load_or_default(&config_path)?;
            logging::init(&config.logging.level);
            let store = Arc::new(SqliteStore::open(&config.storage.database).await?);

            match command {
                Commands::Instances => instances::list(store).await,
                Commands::SetWebhook {
                    instance,
                    url,
                    clear,
                } => instances::set_webhook(store, instance, url, clear).await,
                Commands::WebhookTest { url } => webhook::test(&config, store, url).await,
                Commands::WebhookRetry { delivery_id } => {
                    webhook::retry(&config, store, delivery_id).await
                }
                Commands::WebhookLogs {
                    instance,
                    event,
                    status,
                    limit,
                } => webhook::logs(&config, store, instance, event, status, limit).await,
                Commands::WebhookStats { instance, hours } => {
                    webhook::stats(&config, store, instance, hours).await
                }
                Commands::InitConfig { .. } | Commands::Version => Ok(()),
            }
        }
    }
}
