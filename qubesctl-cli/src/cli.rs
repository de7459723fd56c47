//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// qubesctl - declarative qube reconciliation
#[derive(Parser, Debug)]
#[command(name = "qubesctl")]
#[command(about = "Converge qubes on this host to a declared configuration")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Registry file to operate on
    #[arg(long, global = true)]
    pub registry: Option<String>,

    /// Storage root for the local backend
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Enable development mode (mock VM backend)
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply the requests in a YAML file
    Apply {
        /// One request, a list of requests, or a document with a `qubes_vms` list
        file: PathBuf,
    },

    /// Remove a qube
    Remove {
        name: String,
    },

    /// Print every non-template qube as request YAML
    Dump,

    /// Set registry-wide defaults (a name, or "none" to clear)
    SetDefault {
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        netvm: Option<String>,
        #[arg(long)]
        kernel: Option<String>,
    },

    /// Print host facts used for validation
    Host,
}
