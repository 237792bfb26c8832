//! burrow command-line interface
//!
//! Establishes and scales encrypted tunnels between an on-premises host
//! and cloud bastions: discover what the network can do (`probe`), bring
//! the tunnel set up and keep it scaled (`up`), inspect it (`status`),
//! resize it (`scale`), and tear it down (`down`).

mod api;
mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::BurrowConfig;

/// High-throughput encrypted tunnels into cloud private networks
#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about = "High-throughput encrypted tunnels into cloud private networks", long_about = None)]
pub struct Cli {
    /// Path to the configuration file (default: ~/.burrow/config.yaml)
    #[arg(long, env = "BURROW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run network performance discovery
    Probe {
        /// Region to test against (default from config)
        #[arg(long)]
        region: Option<String>,

        /// Persist detailed results as JSON under ~/.burrow
        #[arg(long)]
        save: bool,

        /// Reduced test set for a fast first look
        #[arg(long)]
        quick: bool,
    },

    /// Deploy the tunnel set and run the collector and scaler until
    /// interrupted
    Up {
        /// Number of tunnels to start with (default: config minimum)
        #[arg(long)]
        tunnels: Option<u32>,

        /// Probe first and apply the discovered MTU and tunnel count
        #[arg(long)]
        auto_optimize: bool,

        /// Region for the bastion (default from config)
        #[arg(long)]
        region: Option<String>,

        /// Port for the health/metrics API (default from config)
        #[arg(long)]
        api_port: Option<u16>,

        /// Use the in-process driver double instead of host tooling
        #[arg(long)]
        mock_driver: bool,
    },

    /// Show tunnel states and performance
    Status,

    /// Scale the tunnel set to a target count
    Scale {
        /// Target tunnel count
        #[arg(long)]
        tunnels: u32,
    },

    /// Tear down every tunnel
    Down,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(fmt::layer().with_target(false))
        .init();

    let config = BurrowConfig::load_from(cli.config.clone())?;

    match cli.command {
        Commands::Probe {
            region,
            save,
            quick,
        } => commands::probe::run(&config, region, save, quick, cli.format).await?,
        Commands::Up {
            tunnels,
            auto_optimize,
            region,
            api_port,
            mock_driver,
        } => {
            commands::up::run(
                &config,
                commands::up::UpOptions {
                    tunnels,
                    auto_optimize,
                    region,
                    api_port,
                    mock_driver,
                },
            )
            .await?
        }
        Commands::Status => commands::status::run(&config, cli.format).await?,
        Commands::Scale { tunnels } => commands::scale::run(&config, tunnels).await?,
        Commands::Down => commands::down::run(&config).await?,
    }

    Ok(())
}
