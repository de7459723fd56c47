//! Diff & converge: create a missing qube or push property differences.

use qubesctl_hypervisor::{
    Label, NewVm, Property, Qid, VmKind, VmManager, VmProperties, VmRecord,
};
use tracing::{debug, info, instrument, warn};

use crate::capability::KindCapabilities;
use crate::error::ConvergeError;
use crate::options::ResolvedOptions;
use crate::registry::Registry;

/// Result of converging one qube.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergeOutcome {
    pub qid: Qid,
    pub changed: bool,
}

/// Bring the qube named in `resolved` to the resolved state.
///
/// The registry is mutated in place; persisting it is the caller's job.
#[instrument(skip_all, fields(vm_name = %resolved.name, kind = %resolved.kind, backend = manager.name()))]
pub fn converge(
    resolved: &ResolvedOptions,
    registry: &mut Registry,
    manager: &dyn VmManager,
) -> Result<ConvergeOutcome, ConvergeError> {
    match registry.by_name(&resolved.name).cloned() {
        None => create(resolved, registry, manager),
        Some(existing) => update(resolved, existing, registry, manager),
    }
}

fn create(
    resolved: &ResolvedOptions,
    registry: &mut Registry,
    manager: &dyn VmManager,
) -> Result<ConvergeOutcome, ConvergeError> {
    let name = resolved.name.clone();
    let creation_failed = |source| ConvergeError::CreationFailed {
        name: name.clone(),
        source,
    };

    let qid = registry.next_qid();
    let caps = resolved.kind.capabilities();

    // Label is always part of a resolved request; the placeholder is overwritten below.
    let mut properties = VmProperties::defaults_for(resolved.kind, Label::Red);
    properties.template = resolved.template;
    if caps.uses_network && resolved.kind != VmKind::NetVm {
        properties.netvm = registry.default_netvm();
        properties.uses_default_netvm = true;
    }
    if caps.has_kernel {
        properties.kernel = registry.default_kernel().map(str::to_string);
        properties.uses_default_kernel = true;
    }
    for (property, value) in &resolved.properties {
        properties
            .set(*property, value.clone())
            .map_err(creation_failed)?;
    }

    let new_vm = NewVm {
        qid,
        name: resolved.name.clone(),
        kind: resolved.kind,
        pool: resolved
            .pool
            .clone()
            .unwrap_or_else(|| registry.default_pool().to_string()),
        properties,
    };

    info!(qid, pool = %new_vm.pool, "Creating qube");
    let record = manager.create(&new_vm).map_err(creation_failed)?;

    let source = resolved
        .base_template
        .and_then(|template| registry.get(template))
        .cloned();
    let committed = manager
        .provision_disk(&record, source.as_ref())
        .map_err(creation_failed)
        .and_then(|()| registry.insert(record.clone()).map_err(ConvergeError::from));
    if let Err(e) = committed {
        // Leave nothing on the backend the registry does not know about.
        if let Err(cleanup) = manager.remove_from_disk(&record) {
            warn!(qid, error = %cleanup, "Failed to clean up partially created qube");
        }
        return Err(e);
    }

    info!(qid, base_template = ?source.map(|t| t.name), "Qube created");
    Ok(ConvergeOutcome { qid, changed: true })
}

fn update(
    resolved: &ResolvedOptions,
    mut record: VmRecord,
    registry: &mut Registry,
    manager: &dyn VmManager,
) -> Result<ConvergeOutcome, ConvergeError> {
    if record.kind != resolved.kind {
        return Err(ConvergeError::ImmutableKindChanged {
            name: record.name,
            current: record.kind,
            requested: resolved.kind,
        });
    }
    if let Some(pool) = &resolved.pool {
        if *pool != record.pool {
            return Err(ConvergeError::ImmutablePoolChanged {
                name: record.name,
                current: record.pool,
                requested: pool.clone(),
            });
        }
    }

    if resolved.properties.contains_key(&Property::Template) {
        let current = record.properties.template.is_none();
        if current != resolved.standalone {
            return Err(ConvergeError::ImmutableStandaloneChanged {
                name: record.name,
                current,
                requested: resolved.standalone,
            });
        }
    }

    let mut changed = false;
    for property in Property::ALL {
        let Some(desired) = resolved.properties.get(&property) else {
            continue;
        };
        let current = record.properties.get(property);
        if current == *desired {
            continue;
        }

        info!(%property, from = %current, to = %desired, "Updating property");
        let update_failed = |source| ConvergeError::UpdateFailed {
            name: record.name.clone(),
            property,
            source,
        };
        manager
            .set_property(&record, property, desired)
            .map_err(update_failed)?;
        record
            .properties
            .set(property, desired.clone())
            .map_err(update_failed)?;
        changed = true;
    }

    let qid = record.qid;
    if changed {
        if let Some(slot) = registry.get_mut(qid) {
            *slot = record;
        }
    } else {
        debug!("Qube already converged");
    }
    Ok(ConvergeOutcome { qid, changed })
}
