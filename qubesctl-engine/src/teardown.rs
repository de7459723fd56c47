//! Teardown: safe removal of a qube and everything pointing at it.
//!
//! [`plan_removal`] decides what must change without touching anything;
//! [`run`] stops the qube, plans, and commits. Only the commit step mutates
//! the registry, so every refusal leaves it as it was.

use qubesctl_hypervisor::{Qid, VmManager, VmRecord};
use tracing::{info, instrument, warn};

use crate::error::TeardownError;
use crate::registry::Registry;

/// Registry changes staged for one removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownPlan {
    pub qid: Qid,
    pub name: String,
    pub clear_default_template: bool,
    pub clear_default_netvm: bool,
    /// Qubes whose netvm or dispvm_netvm must be reset to none
    pub detach_clients: Vec<Qid>,
}

/// Check that `record` may go and stage the registry changes.
pub fn plan_removal(record: &VmRecord, registry: &Registry) -> Result<TeardownPlan, TeardownError> {
    let dependents: Vec<String> = registry
        .dependents_of_template(record.qid)
        .into_iter()
        .map(|vm| vm.name.clone())
        .collect();
    if !dependents.is_empty() {
        return Err(TeardownError::TemplateInUse {
            name: record.name.clone(),
            dependents,
        });
    }

    let plan = TeardownPlan {
        qid: record.qid,
        name: record.name.clone(),
        clear_default_template: registry.default_template() == Some(record.qid),
        clear_default_netvm: registry.default_netvm() == Some(record.qid),
        detach_clients: registry
            .network_clients_of(record.qid)
            .into_iter()
            .map(|vm| vm.qid)
            .collect(),
    };

    if record.installed_by_rpm {
        return Err(TeardownError::ManagedExternally(record.name.clone()));
    }
    Ok(plan)
}

/// Remove the qube called `name`. Returns whether anything changed.
#[instrument(skip(registry, manager), fields(backend = manager.name()))]
pub fn run(name: &str, registry: &mut Registry, manager: &dyn VmManager) -> Result<bool, TeardownError> {
    let Some(record) = registry.by_name(name).cloned() else {
        info!("Qube absent already");
        return Ok(false);
    };

    if record.is_running {
        info!("Shutting down running qube");
        manager
            .force_shutdown(&record)
            .map_err(|source| TeardownError::ShutdownFailed {
                name: record.name.clone(),
                source,
            })?;
    }

    let plan = plan_removal(&record, registry)?;
    commit(&plan, &record, registry, manager)?;
    Ok(true)
}

fn commit(
    plan: &TeardownPlan,
    record: &VmRecord,
    registry: &mut Registry,
    manager: &dyn VmManager,
) -> Result<(), TeardownError> {
    manager
        .remove_from_disk(record)
        .map_err(|source| TeardownError::RemovalFailed {
            name: plan.name.clone(),
            source,
        })?;

    for client in &plan.detach_clients {
        if let Some(vm) = registry.get_mut(*client) {
            warn!(client = %vm.name, "Detaching network client");
            if vm.properties.netvm == Some(plan.qid) {
                vm.properties.netvm = None;
            }
            if vm.properties.dispvm_netvm == Some(plan.qid) {
                vm.properties.dispvm_netvm = None;
            }
        }
    }

    // Removal clears default pointers to the record.
    registry.remove(plan.qid)?;
    info!(
        cleared_default_template = plan.clear_default_template,
        cleared_default_netvm = plan.clear_default_netvm,
        detached = plan.detach_clients.len(),
        "Qube removed"
    );
    Ok(())
}
