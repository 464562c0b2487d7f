//! OpenSASE Steer CLI
//!
//! Command-line client for the steering controller's control API.
//!
//! # Usage
//!
//! ```bash
//! steerctl status
//! steerctl channel apply -f channels.json
//! steerctl channel switch 1 2
//! steerctl ovs update -f ovs.json
//! steerctl qkey 1 2 "$KEY"
//! steerctl statistics --per-switch --format json
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod config;
mod output;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "steerctl")]
#[command(author = "OpenSASE")]
#[command(version)]
#[command(about = "OpenSASE Steer command line client", long_about = None)]
struct Cli {
    /// Controller API URL [default: http://127.0.0.1:8080]
    #[arg(long, env = "STEER_API_URL")]
    api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    format: Option<output::OutputFormat>,

    /// Profile name from config file
    #[arg(long, short)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the controller is up
    Status,
    /// Number of configured channels
    Channels,
    /// Channel packet counters
    Statistics {
        /// Break down by switch, with port counters
        #[arg(long)]
        per_switch: bool,
    },
    /// Attached switches
    Switches,
    /// Install rules for every active channel
    Activate,
    /// Manage channels
    Channel {
        #[command(subcommand)]
        action: ChannelCommands,
    },
    /// Manage switch descriptors
    Ovs {
        #[command(subcommand)]
        action: OvsCommands,
    },
    /// Forward key material to the service group of an SLA
    Qkey {
        /// Switch id as configured under `ovs`
        ovs: String,
        /// SLA id
        sla: String,
        /// Payload sent verbatim
        payload: String,
    },
    /// Configure CLI
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ChannelCommands {
    /// Create or replace channels from a JSON or YAML file
    Apply {
        #[arg(short, long)]
        file: String,
    },
    /// Move a channel to another SLA (0 deactivates)
    Switch { channel: String, sla: String },
}

#[derive(Subcommand)]
pub enum OvsCommands {
    /// Merge switch descriptors from a JSON or YAML file
    Update {
        #[arg(short, long)]
        file: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set configuration value
    Set { key: String, value: String },
    /// Get configuration value
    Get { key: String },
    /// List all configuration
    List,
    /// Initialize configuration
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = config::Config::load(cli.profile.as_deref()).unwrap_or_default();
    let api_url = cli
        .api_url
        .or(config.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.into());
    let format = cli.format.or_else(|| config.format()).unwrap_or(output::OutputFormat::Table);

    let client = commands::ApiClient::new(&api_url);

    let result = match cli.command {
        Commands::Status => commands::status::status(&client).await,
        Commands::Channels => commands::status::channels(&client).await,
        Commands::Statistics { per_switch } => {
            commands::status::statistics(&client, per_switch, format).await
        }
        Commands::Switches => commands::status::switches(&client, format).await,
        Commands::Activate => commands::status::activate(&client, format).await,
        Commands::Channel { action } => commands::channel::handle(action, &client, format).await,
        Commands::Ovs { action } => commands::ovs::handle(action, &client, format).await,
        Commands::Qkey { ovs, sla, payload } => commands::qkey::send(&client, &ovs, &sla, payload).await,
        Commands::Config { action } => commands::config::handle(action, cli.profile.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
