//! Error types for the VM-management layer.

use thiserror::Error;

/// Errors that can occur during VM-management operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// Failed to create a VM.
    #[error("Failed to create VM: {0}")]
    CreateFailed(String),

    /// Failed to provision the VM's disk images.
    #[error("Failed to provision disk: {0}")]
    ProvisionFailed(String),

    /// Failed to stop a VM.
    #[error("Failed to stop VM: {0}")]
    StopFailed(String),

    /// Failed to delete a VM.
    #[error("Failed to delete VM: {0}")]
    DeleteFailed(String),

    /// A property write was refused.
    #[error("Property rejected: {0}")]
    PropertyRejected(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for VM-management operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
