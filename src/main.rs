//! Firewall engine daemon.
//!
//! Loads a TOML config, connects backends, runs the background schedulers
//! and waits for Ctrl-C.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use firewall_engine::{Firewall, FirewallConfig};

#[derive(Parser, Debug)]
#[command(name = "firewall-engine", version, about = "Request-filtering decision engine")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "FIREWALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine and run until interrupted (default)
    Serve,
    /// Import the Spamhaus ASN-DROP feed once and exit
    ImportSpamhaus,
    /// Connect, print a health snapshot as JSON and exit
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => FirewallConfig::load(path)?,
        None => FirewallConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let firewall = Firewall::connect(config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            firewall.start().await?;
            info!("Serving, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            firewall.shutdown().await;
        }
        Command::ImportSpamhaus => {
            firewall.start().await?;
            let report = firewall.import_spamhaus().await;
            firewall.events().wait_idle(std::time::Duration::from_secs(30)).await;
            firewall.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
        Command::Health => {
            let health = firewall.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}
