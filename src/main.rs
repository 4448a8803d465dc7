//! Keytrim - lossless MP4 trimming
//!
//! # Usage
//!
//! ```bash
//! keytrim trim --input in.mp4 --output out.mp4 --start 00:01:00 --end 00:02:00
//! keytrim inspect --input in.mp4 --json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use keytrim::cli::{commands, Cli, Commands};
use keytrim::config_initialization::initialize_configuration_hierarchy;
use keytrim::utils::logging::init_logging;

/// Main entry point for the Keytrim CLI
fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = initialize_configuration_hierarchy(&cli.overrides()).context("Invalid configuration")?;
    init_logging(&config.logging()).context("Failed to initialize logging")?;
    info!("Starting Keytrim {}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Trim(args) => {
            info!("Executing trim command");
            let output = commands::trim(args, &config)?;
            println!("{}", output.display());
        }
        Commands::Inspect(args) => {
            info!("Executing inspect command");
            commands::inspect(args)?;
        }
    }

    Ok(())
}
