//! # qubesctl
//!
//! Command-line front end for the qube convergence engine: argument parsing,
//! configuration, and the subcommand handlers used by the `qubesctl` binary.

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{Args, Command};
pub use config::Config;
