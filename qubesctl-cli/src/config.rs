//! Configuration management for qubesctl.

use anyhow::{bail, Context, Result};
use qubesctl_common::LogFormat;
use qubesctl_engine::DEFAULT_LOCK_TIMEOUT_MS;
use qubesctl_hypervisor::{DEFAULT_PRIVATE_SIZE_MIB, DEFAULT_STORAGE_PATH};
use qubesctl_telemetry::DEFAULT_KERNELS_DIR;
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/qubesctl/qubesctl.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry location and locking
    pub registry: RegistryConfig,
    /// Host fact sources
    pub host: HostConfig,
    /// VM backend configuration
    pub hypervisor: HypervisorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields `None`.
    ///
    /// A file that exists but cannot be read or parsed is still an error.
    pub fn load_if_present<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref registry) = args.registry {
            self.registry.path = registry.clone();
        }

        if let Some(ref storage) = args.storage {
            self.hypervisor.storage_path = storage.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        self
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.registry.path.trim().is_empty() {
            bail!("registry.path must not be empty");
        }
        if self.registry.lock_timeout_ms == 0 {
            bail!("registry.lock_timeout_ms must be greater than zero");
        }
        if self.hypervisor.backend == HypervisorBackend::Local
            && self.hypervisor.storage_path.trim().is_empty()
        {
            bail!("hypervisor.storage_path must not be empty for the local backend");
        }
        self.logging.format()?;
        Ok(())
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path of the registry JSON file
    pub path: String,
    /// How long to wait for the registry lock
    pub lock_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/qubesctl/qubes.json".to_string(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

/// Host fact configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding installed VM kernels
    pub kernels_dir: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kernels_dir: DEFAULT_KERNELS_DIR.to_string(),
        }
    }
}

/// VM backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Storage root for VM directories
    pub storage_path: String,
    /// Size of fresh private images
    pub default_private_size_mib: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Local,
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
            default_private_size_mib: DEFAULT_PRIVATE_SIZE_MIB,
        }
    }
}

/// VM backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// One directory per VM under `storage_path`
    #[default]
    Local,
    /// In-memory backend for development
    Mock,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty or json)
    #[serde(rename = "format")]
    pub format_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format_name: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn format(&self) -> Result<LogFormat> {
        self.format_name.parse()
    }
}
