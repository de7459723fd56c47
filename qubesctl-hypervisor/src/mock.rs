//! Mock VM-management backend for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::VmManager;
use crate::types::*;

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Create,
    ProvisionDisk,
    SetProperty,
    ForceShutdown,
    RemoveFromDisk,
    IsRunning,
}

/// Mock backend that keeps VMs in memory.
///
/// Useful for:
/// - Unit and integration testing
/// - Development without a host storage root (`--dev`)
///
/// Every call is appended to a journal so tests can assert on exactly which
/// operations the engine issued.
pub struct MockBackend {
    vms: RwLock<HashMap<Qid, MockVm>>,
    failures: RwLock<HashSet<MockOperation>>,
    journal: RwLock<Vec<String>>,
}

struct MockVm {
    record: VmRecord,
    running: bool,
    /// Name of the template the disk was cloned from, once provisioned
    disk_source: Option<String>,
    provisioned: bool,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock VM-management backend");
        Self {
            vms: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashSet::new()),
            journal: RwLock::new(Vec::new()),
        }
    }

    /// Register a VM that already exists on the host (e.g. seeded into a registry).
    pub fn adopt(&self, record: &VmRecord) -> Result<()> {
        let mut vms = self.write_vms()?;
        vms.insert(
            record.qid,
            MockVm {
                record: record.clone(),
                running: record.is_running,
                disk_source: None,
                provisioned: true,
            },
        );
        Ok(())
    }

    /// Mark a VM as running.
    pub fn start(&self, qid: Qid) -> Result<()> {
        let mut vms = self.write_vms()?;
        let vm = vms
            .get_mut(&qid)
            .ok_or_else(|| HypervisorError::VmNotFound(qid.to_string()))?;
        vm.running = true;
        Ok(())
    }

    /// Make every future call of `operation` fail.
    pub fn fail_on(&self, operation: MockOperation) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(operation);
        }
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
    }

    /// Whether the backend holds a VM with this qid.
    pub fn contains(&self, qid: Qid) -> bool {
        self.vms.read().map(|vms| vms.contains_key(&qid)).unwrap_or(false)
    }

    /// Template the VM's disk was cloned from, if it was provisioned from one.
    pub fn disk_source(&self, qid: Qid) -> Option<String> {
        let vms = self.vms.read().ok()?;
        vms.get(&qid).and_then(|vm| vm.disk_source.clone())
    }

    /// Whether the VM's disk has been provisioned.
    pub fn is_provisioned(&self, qid: Qid) -> bool {
        self.vms
            .read()
            .map(|vms| vms.get(&qid).map(|vm| vm.provisioned).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Backend's view of a VM.
    pub fn record(&self, qid: Qid) -> Option<VmRecord> {
        let vms = self.vms.read().ok()?;
        vms.get(&qid).map(|vm| vm.record.clone())
    }

    /// Calls issued so far, as `operation:name[:detail]` entries.
    pub fn journal(&self) -> Vec<String> {
        self.journal.read().map(|j| j.clone()).unwrap_or_default()
    }

    /// Forget the journal.
    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.journal.write() {
            journal.clear();
        }
    }

    fn record_call(&self, entry: String) {
        if let Ok(mut journal) = self.journal.write() {
            journal.push(entry);
        }
    }

    fn check_failure(&self, operation: MockOperation, name: &str) -> Result<()> {
        let failures = self
            .failures
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        if !failures.contains(&operation) {
            return Ok(());
        }

        let message = format!("injected failure for {}", name);
        Err(match operation {
            MockOperation::Create => HypervisorError::CreateFailed(message),
            MockOperation::ProvisionDisk => HypervisorError::ProvisionFailed(message),
            MockOperation::SetProperty => HypervisorError::PropertyRejected(message),
            MockOperation::ForceShutdown => HypervisorError::StopFailed(message),
            MockOperation::RemoveFromDisk => HypervisorError::DeleteFailed(message),
            MockOperation::IsRunning => HypervisorError::Internal(message),
        })
    }

    fn write_vms(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Qid, MockVm>>> {
        self.vms
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VmManager for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    #[instrument(skip(self, vm), fields(qid = vm.qid, vm_name = %vm.name, kind = %vm.kind))]
    fn create(&self, vm: &NewVm) -> Result<VmRecord> {
        info!("Creating mock VM");
        self.record_call(format!("create:{}", vm.name));
        self.check_failure(MockOperation::Create, &vm.name)?;

        let mut vms = self.write_vms()?;
        if vms.contains_key(&vm.qid) || vms.values().any(|v| v.record.name == vm.name) {
            return Err(HypervisorError::CreateFailed(format!(
                "VM {} already exists",
                vm.name
            )));
        }

        let record = vm.clone().into_record();
        vms.insert(
            vm.qid,
            MockVm {
                record: record.clone(),
                running: false,
                disk_source: None,
                provisioned: false,
            },
        );

        info!("Mock VM created");
        Ok(record)
    }

    #[instrument(skip(self, record, source_template), fields(vm_name = %record.name))]
    fn provision_disk(&self, record: &VmRecord, source_template: Option<&VmRecord>) -> Result<()> {
        let source = source_template.map(|t| t.name.clone());
        debug!(source = ?source, "Provisioning mock disk");
        self.record_call(match &source {
            Some(name) => format!("provision_disk:{}:{}", record.name, name),
            None => format!("provision_disk:{}", record.name),
        });
        self.check_failure(MockOperation::ProvisionDisk, &record.name)?;

        let mut vms = self.write_vms()?;
        let vm = vms
            .get_mut(&record.qid)
            .ok_or_else(|| HypervisorError::VmNotFound(record.name.clone()))?;
        vm.disk_source = source;
        vm.provisioned = true;
        Ok(())
    }

    #[instrument(skip(self, record), fields(vm_name = %record.name))]
    fn force_shutdown(&self, record: &VmRecord) -> Result<()> {
        info!("Force stopping mock VM");
        self.record_call(format!("force_shutdown:{}", record.name));
        self.check_failure(MockOperation::ForceShutdown, &record.name)?;

        let mut vms = self.write_vms()?;
        let vm = vms
            .get_mut(&record.qid)
            .ok_or_else(|| HypervisorError::VmNotFound(record.name.clone()))?;
        vm.running = false;
        vm.record.is_running = false;
        Ok(())
    }

    #[instrument(skip(self, record), fields(vm_name = %record.name))]
    fn remove_from_disk(&self, record: &VmRecord) -> Result<()> {
        info!("Deleting mock VM");
        self.record_call(format!("remove_from_disk:{}", record.name));
        self.check_failure(MockOperation::RemoveFromDisk, &record.name)?;

        let mut vms = self.write_vms()?;
        if let Some(vm) = vms.get(&record.qid) {
            if vm.running {
                return Err(HypervisorError::DeleteFailed(
                    "VM must be stopped before deletion".to_string(),
                ));
            }
        }
        vms.remove(&record.qid);
        Ok(())
    }

    #[instrument(skip(self, record, value), fields(vm_name = %record.name, property = %property, value = %value))]
    fn set_property(&self, record: &VmRecord, property: Property, value: &PropertyValue) -> Result<()> {
        debug!("Setting mock VM property");
        self.record_call(format!("set_property:{}:{}", record.name, property));
        self.check_failure(MockOperation::SetProperty, &record.name)?;

        let mut vms = self.write_vms()?;
        let vm = vms
            .get_mut(&record.qid)
            .ok_or_else(|| HypervisorError::VmNotFound(record.name.clone()))?;
        vm.record.properties.set(property, value.clone())
    }

    fn is_running(&self, record: &VmRecord) -> Result<bool> {
        self.check_failure(MockOperation::IsRunning, &record.name)?;
        let vms = self
            .vms
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        // Unknown VMs are not running anywhere.
        Ok(vms.get(&record.qid).map(|vm| vm.running).unwrap_or(false))
    }
}
