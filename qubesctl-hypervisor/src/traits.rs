//! Core VM-management abstraction trait.

use crate::error::Result;
use crate::types::*;

/// VM-management API used by the convergence engine.
///
/// Calls are synchronous: the engine runs every operation inside the
/// registry lock and never yields while holding it.
pub trait VmManager: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a VM's on-host presence (does not provision images).
    ///
    /// Returns the record as the backend sees it.
    fn create(&self, vm: &NewVm) -> Result<VmRecord>;

    /// Provision disk images for a freshly created VM.
    ///
    /// `source_template` is the template to clone from, if any.
    fn provision_disk(&self, record: &VmRecord, source_template: Option<&VmRecord>) -> Result<()>;

    /// Power off a VM immediately.
    fn force_shutdown(&self, record: &VmRecord) -> Result<()>;

    /// Delete a VM's files. The VM must not be running.
    fn remove_from_disk(&self, record: &VmRecord) -> Result<()>;

    // =========================================================================
    // State
    // =========================================================================

    /// Apply a single property change.
    fn set_property(&self, record: &VmRecord, property: Property, value: &PropertyValue) -> Result<()>;

    /// Whether the VM is currently running.
    fn is_running(&self, record: &VmRecord) -> Result<bool>;
}
