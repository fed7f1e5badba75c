//! Fleet usage CLI
//!
//! Lists the collector instances a fleet usage daemon manages and queries
//! current and historical cluster usage.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{instances, usage};

/// Fleet usage CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the fleet usage tracker", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List managed collector instances
    Instances,

    /// Query cluster usage
    #[command(subcommand)]
    Usage(UsageCommands),

    /// Manage CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum UsageCommands {
    /// Show the latest usage snapshot of every cluster
    Current,

    /// Show usage history
    History {
        /// Cluster name, or "all" for the whole fleet
        #[arg(long, short)]
        cluster: Option<String>,

        /// Range start (YYYY-MM-DDTHH:MM:SS, UTC)
        #[arg(long)]
        start: Option<String>,

        /// Range end (YYYY-MM-DDTHH:MM:SS, UTC)
        #[arg(long)]
        end: Option<String>,

        /// Aggregation period (hourly, monthly)
        #[arg(long, short)]
        period: Option<String>,

        /// Print raw CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Persist the API endpoint URL
    SetApiUrl {
        /// API endpoint URL
        url: String,
    },

    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::Config::load()?;
    let api_url = cfg.resolve_api_url(cli.api_url.clone());

    if let Commands::Config(config_cmd) = &cli.command {
        match config_cmd {
            ConfigCommands::SetApiUrl { url } => {
                ::url::Url::parse(url).with_context(|| format!("Invalid API URL: {}", url))?;
                cfg.api_url = Some(url.clone());
                let path = cfg.save()?;
                output::print_success(&format!("Saved API URL to {}", path.display()));
            }
            ConfigCommands::Show => {
                println!("API URL: {}", api_url.cyan());
            }
        }
        return Ok(());
    }

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    // Execute command
    match cli.command {
        Commands::Instances => {
            instances::list_instances(&client, cli.format).await?;
        }
        Commands::Usage(usage_cmd) => match usage_cmd {
            UsageCommands::Current => {
                usage::show_current(&client, cli.format).await?;
            }
            UsageCommands::History {
                cluster,
                start,
                end,
                period,
                csv,
            } => {
                let args = usage::HistoryArgs {
                    cluster,
                    start,
                    end,
                    period,
                    csv,
                };
                usage::show_history(&client, args, cli.format).await?;
            }
        },
        Commands::Config(_) => {}
    }

    Ok(())
}
