//! # qubesctl
//!
//! Reconciles declared qubes against this host.
//!
//! ## Usage
//! ```bash
//! qubesctl apply qubes.yaml
//! qubesctl remove old-work
//! qubesctl dump > current.yaml
//! qubesctl set-default --template fedora-23 --netvm sys-net
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use qubesctl_cli::commands;
use qubesctl_cli::config::{Config, DEFAULT_CONFIG_PATH};
use qubesctl_cli::Args;

fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let (config, source) = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            let cfg = Config::load(config_path)?;
            (cfg.with_cli_overrides(&args), config_path.clone())
        }
        None => {
            // Use the default location if present, otherwise CLI-only config
            match Config::load_if_present(DEFAULT_CONFIG_PATH)? {
                Some(cfg) => (cfg.with_cli_overrides(&args), DEFAULT_CONFIG_PATH.to_string()),
                None => (Config::default_with_cli(&args), "defaults".to_string()),
            }
        }
    };
    config.validate()?;

    // Initialize logging
    qubesctl_common::init_logging(&config.logging.level, config.logging.format()?)?;

    info!(version = env!("CARGO_PKG_VERSION"), config = %source, "Starting qubesctl");
    debug!(?config, "Effective configuration");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = commands::run(&args.command, &config, &mut out) {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}
