//! # qubesctl Common
//!
//! Shared utilities for the qubesctl components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use qubesctl_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(vm = "work", "Reconciling qube");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
