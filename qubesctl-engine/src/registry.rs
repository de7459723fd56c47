//! The qube registry: every known record plus the host-wide default pointers.

use std::collections::BTreeMap;

use qubesctl_hypervisor::{Qid, VmRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;

/// Pool used when neither the request nor the registry names one.
pub const DEFAULT_POOL: &str = "default";

/// First qid handed out; 0 belongs to the administrative domain.
const FIRST_QID: Qid = 1;

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

/// All qube records keyed by qid.
///
/// Default pointers only ever reference existing records of the right
/// capability: the setters check, and [`Registry::remove`] clears them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    vms: BTreeMap<Qid, VmRecord>,
    #[serde(default)]
    default_template: Option<Qid>,
    #[serde(default)]
    default_netvm: Option<Qid>,
    #[serde(default)]
    default_kernel: Option<String>,
    #[serde(default = "default_pool")]
    default_pool: String,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            vms: BTreeMap::new(),
            default_template: None,
            default_netvm: None,
            default_kernel: None,
            default_pool: default_pool(),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, qid: Qid) -> Option<&VmRecord> {
        self.vms.get(&qid)
    }

    pub(crate) fn get_mut(&mut self, qid: Qid) -> Option<&mut VmRecord> {
        self.vms.get_mut(&qid)
    }

    pub fn by_name(&self, name: &str) -> Option<&VmRecord> {
        self.vms.values().find(|vm| vm.name == name)
    }

    /// Records in qid order.
    pub fn iter(&self) -> impl Iterator<Item = &VmRecord> {
        self.vms.values()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// Name of the qube with this qid, for messages.
    pub fn name_of(&self, qid: Qid) -> Option<&str> {
        self.vms.get(&qid).map(|vm| vm.name.as_str())
    }

    /// Smallest unused qid above every existing one.
    pub fn next_qid(&self) -> Qid {
        self.vms
            .keys()
            .next_back()
            .map(|max| max + 1)
            .unwrap_or(FIRST_QID)
    }

    /// Records based on the template `qid`.
    pub fn dependents_of_template(&self, qid: Qid) -> Vec<&VmRecord> {
        self.vms
            .values()
            .filter(|vm| vm.properties.template == Some(qid))
            .collect()
    }

    /// Records routing their network or disposable network through `qid`.
    pub fn network_clients_of(&self, qid: Qid) -> Vec<&VmRecord> {
        self.vms
            .values()
            .filter(|vm| vm.qid != qid)
            .filter(|vm| {
                vm.properties.netvm == Some(qid) || vm.properties.dispvm_netvm == Some(qid)
            })
            .collect()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Add a record. Names and qids must be unused.
    pub fn insert(&mut self, record: VmRecord) -> Result<(), RegistryError> {
        if self.by_name(&record.name).is_some() {
            return Err(RegistryError::DuplicateName(record.name));
        }
        if self.vms.contains_key(&record.qid) {
            return Err(RegistryError::DuplicateName(format!(
                "{} (qid {} in use)",
                record.name, record.qid
            )));
        }
        debug!(qid = record.qid, vm_name = %record.name, "Registry insert");
        self.vms.insert(record.qid, record);
        Ok(())
    }

    /// Remove a record, clearing any default pointer to it.
    pub fn remove(&mut self, qid: Qid) -> Result<VmRecord, RegistryError> {
        let record = self
            .vms
            .remove(&qid)
            .ok_or_else(|| RegistryError::UnknownVm(format!("qid {}", qid)))?;

        if self.default_template == Some(qid) {
            self.default_template = None;
        }
        if self.default_netvm == Some(qid) {
            self.default_netvm = None;
        }
        debug!(qid, vm_name = %record.name, "Registry remove");
        Ok(record)
    }

    pub fn set_running(&mut self, qid: Qid, running: bool) {
        if let Some(vm) = self.vms.get_mut(&qid) {
            vm.is_running = running;
        }
    }

    // =========================================================================
    // Default pointers
    // =========================================================================

    pub fn default_template(&self) -> Option<Qid> {
        self.default_template
    }

    pub fn default_netvm(&self) -> Option<Qid> {
        self.default_netvm
    }

    pub fn default_kernel(&self) -> Option<&str> {
        self.default_kernel.as_deref()
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    pub fn set_default_template(&mut self, qid: Option<Qid>) -> Result<(), RegistryError> {
        if let Some(qid) = qid {
            let vm = self.lookup(qid)?;
            if !vm.is_template() {
                return Err(RegistryError::WrongCapability {
                    name: vm.name.clone(),
                    role: "template",
                });
            }
        }
        self.default_template = qid;
        Ok(())
    }

    pub fn set_default_netvm(&mut self, qid: Option<Qid>) -> Result<(), RegistryError> {
        if let Some(qid) = qid {
            let vm = self.lookup(qid)?;
            if !vm.is_netvm() {
                return Err(RegistryError::WrongCapability {
                    name: vm.name.clone(),
                    role: "netvm",
                });
            }
        }
        self.default_netvm = qid;
        Ok(())
    }

    /// Kernel presence on the host is checked by the caller.
    pub fn set_default_kernel(&mut self, kernel: Option<String>) {
        self.default_kernel = kernel;
    }

    pub fn set_default_pool(&mut self, pool: impl Into<String>) {
        self.default_pool = pool.into();
    }

    fn lookup(&self, qid: Qid) -> Result<&VmRecord, RegistryError> {
        self.vms
            .get(&qid)
            .ok_or_else(|| RegistryError::UnknownVm(format!("qid {}", qid)))
    }
}
