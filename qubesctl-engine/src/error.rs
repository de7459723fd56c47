//! Error types for the convergence engine.
//!
//! One enum per component; [`EngineError`] unions them for callers that only
//! need to report.

use std::path::PathBuf;

use qubesctl_hypervisor::{HypervisorError, Property, VmKind};
use thiserror::Error;

/// Request rejected by option derivation. Nothing has been touched.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Label is required for qube '{0}'")]
    LabelRequired(String),

    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    #[error("No default template is set, specify a template for '{0}'")]
    NoDefaultTemplate(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("'{0}' is not a template")]
    NotATemplate(String),

    #[error("{resource}={requested} exceeds host capacity ({available})")]
    ResourceExceedsHost {
        resource: &'static str,
        requested: i64,
        available: u64,
    },

    #[error("Invalid MAC address '{0}', expected six colon-separated hex pairs or 'auto'")]
    InvalidMacFormat(String),

    #[error("Invalid {property} reference '{target}': {reason}")]
    InvalidNetvmReference {
        property: Property,
        target: String,
        reason: &'static str,
    },

    #[error("Kernel not installed: {0}")]
    KernelNotFound(String),

    #[error("Invalid timezone '{0}', expected 'localtime' or an offset in seconds")]
    InvalidTimezone(String),

    #[error("Property {property} is not supported by {kind} qubes")]
    UnsupportedProperty { property: Property, kind: VmKind },
}

/// Failure while registry state was being read, written or mutated.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timed out acquiring registry lock {path} after {timeout_ms}ms")]
    LockTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("A qube named '{0}' already exists")]
    DuplicateName(String),

    #[error("Unknown qube: {0}")]
    UnknownVm(String),

    #[error("'{name}' cannot be used as default {role}")]
    WrongCapability { name: String, role: &'static str },
}

/// Failure while creating or updating a qube.
#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("Cannot change kind of '{name}' from {current} to {requested}")]
    ImmutableKindChanged {
        name: String,
        current: VmKind,
        requested: VmKind,
    },

    #[error("Cannot change pool of '{name}' from '{current}' to '{requested}'")]
    ImmutablePoolChanged {
        name: String,
        current: String,
        requested: String,
    },

    #[error("Cannot change standalone-ness of '{name}' from {current} to {requested}")]
    ImmutableStandaloneChanged {
        name: String,
        current: bool,
        requested: bool,
    },

    #[error("Failed to create '{name}': {source}")]
    CreationFailed {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to set {property} on '{name}': {source}")]
    UpdateFailed {
        name: String,
        property: Property,
        #[source]
        source: HypervisorError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure while removing a qube.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error("Failed to shut down '{name}': {source}")]
    ShutdownFailed {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("Template '{name}' is still used by: {}", .dependents.join(", "))]
    TemplateInUse { name: String, dependents: Vec<String> },

    #[error("'{0}' is installed by the package manager, remove the package instead")]
    ManagedExternally(String),

    #[error("Failed to remove '{name}' from disk: {source}")]
    RemovalFailed {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Any engine failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Converge(#[from] ConvergeError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
