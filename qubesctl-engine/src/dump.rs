//! Export the registry as declarative requests.

use qubesctl_hypervisor::{Property, Qid, Timezone, VmRecord};
use serde::{Deserialize, Serialize};

use crate::capability::KindCapabilities;
use crate::registry::Registry;
use crate::request::{DesiredState, TimezoneSpec, VmRef, VmRequest};

/// Document layout used for files holding several requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QubesDocument {
    pub qubes_vms: Vec<VmRequest>,
}

/// Requests describing every non-template qube as it currently is.
///
/// Only properties the qube's kind supports are emitted.
pub fn dump_registry(registry: &Registry) -> Vec<VmRequest> {
    registry
        .iter()
        .filter(|vm| !vm.is_template())
        .map(|vm| dump_vm(vm, registry))
        .collect()
}

fn dump_vm(vm: &VmRecord, registry: &Registry) -> VmRequest {
    let caps = vm.kind.capabilities();
    let props = &vm.properties;
    let supported = |property| caps.supports(property).then_some(());

    let reference = |qid: Option<Qid>, uses_default: bool| {
        if uses_default {
            return VmRef::Default;
        }
        qid.and_then(|q| registry.name_of(q))
            .map(|name| VmRef::Named(name.to_string()))
            .unwrap_or(VmRef::None)
    };

    VmRequest {
        name: vm.name.clone(),
        kind: vm.kind,
        state: DesiredState::Present,
        label: Some(props.label.to_string()),
        template: Some(reference(props.template, false)),
        netvm: Some(reference(props.netvm, props.uses_default_netvm)),
        dispvm_netvm: supported(Property::DispvmNetvm)
            .map(|_| reference(props.dispvm_netvm, props.uses_default_dispvm_netvm)),
        kernel: supported(Property::Kernel).map(|_| {
            if props.uses_default_kernel {
                VmRef::Default
            } else {
                props
                    .kernel
                    .clone()
                    .map(VmRef::Named)
                    .unwrap_or(VmRef::None)
            }
        }),
        pool: Some(vm.pool.clone()),
        standalone: Some(props.template.is_none()),
        memory: Some(props.memory as i64),
        maxmem: Some(props.maxmem as i64),
        vcpus: Some(props.vcpus as i64),
        mac: Some(props.mac.clone().unwrap_or_else(|| "auto".to_string())),
        timezone: supported(Property::Timezone).map(|_| match props.timezone {
            Timezone::Localtime => TimezoneSpec::Name("localtime".to_string()),
            Timezone::Offset(offset) => TimezoneSpec::Offset(offset),
        }),
        debug: Some(props.debug),
        autostart: Some(props.autostart),
        include_in_backups: Some(props.include_in_backups),
        internal: Some(props.internal),
        qrexec_installed: Some(props.qrexec_installed),
        guiagent_installed: supported(Property::GuiagentInstalled).map(|_| props.guiagent_installed),
        seamless_gui_mode: supported(Property::SeamlessGuiMode).map(|_| props.seamless_gui_mode),
        pci_strictreset: Some(props.pci_strictreset),
        pci_e820_host: Some(props.pci_e820_host),
        kernelopts: supported(Property::Kernelopts).map(|_| props.kernelopts.clone()),
        default_user: Some(props.default_user.clone()),
        qrexec_timeout: Some(props.qrexec_timeout),
        drive: supported(Property::Drive).and(props.drive.clone()),
    }
}
