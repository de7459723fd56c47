//! Option derivation: turns a [`VmRequest`] into concrete, validated values.
//!
//! Every `default`/`none`/omitted reference is replaced by a qid, a kernel
//! name or an explicit null. Only fields the request actually set end up in
//! the property table; everything else is left to platform defaults (new
//! qubes) or untouched (existing ones).

use std::collections::BTreeMap;

use qubesctl_hypervisor::{Label, Property, PropertyValue, Qid, Timezone, VmKind};
use qubesctl_telemetry::HostFacts;
use tracing::{debug, instrument};

use crate::capability::{Capabilities, KindCapabilities};
use crate::error::ValidationError;
use crate::registry::Registry;
use crate::request::{TimezoneSpec, VmRef, VmRequest};

/// A request after derivation and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub name: String,
    pub kind: VmKind,
    /// Template used to provision the disk at creation
    pub base_template: Option<Qid>,
    /// Value of the `template` property (null when standalone)
    pub template: Option<Qid>,
    pub standalone: bool,
    /// Requested pool, if any
    pub pool: Option<String>,
    /// Explicitly set properties
    pub properties: BTreeMap<Property, PropertyValue>,
}

impl ResolvedOptions {
    pub fn get(&self, property: Property) -> Option<&PropertyValue> {
        self.properties.get(&property)
    }
}

/// Derive and validate the options of a present request.
#[instrument(skip_all, fields(vm_name = %request.name, kind = %request.kind))]
pub fn resolve(
    request: &VmRequest,
    registry: &Registry,
    host: &dyn HostFacts,
) -> Result<ResolvedOptions, ValidationError> {
    let caps = request.kind.capabilities();
    let mut properties = BTreeMap::new();

    // Label
    let label = request
        .label
        .as_deref()
        .ok_or_else(|| ValidationError::LabelRequired(request.name.clone()))?;
    let label: Label = label
        .parse()
        .map_err(|_| ValidationError::UnknownLabel(label.to_string()))?;
    properties.insert(Property::Label, PropertyValue::Label(label));

    check_supported(request, &caps)?;

    // Template and standalone-ness
    let base_template = resolve_template(request, registry, &caps)?;
    let standalone = caps.forced_standalone
        || (request.kind == VmKind::Hvm && base_template.is_none())
        || request.standalone.unwrap_or(false);
    let template = if standalone { None } else { base_template };
    if request.template.is_some() || request.standalone.is_some() {
        properties.insert(Property::Template, opt_vm(template));
    }

    // Resources
    if let Some(memory) = request.memory {
        properties.insert(Property::Memory, check_memory("memory", memory, host)?);
    }
    if let Some(maxmem) = request.maxmem {
        properties.insert(Property::Maxmem, check_memory("maxmem", maxmem, host)?);
    }
    if let Some(vcpus) = request.vcpus {
        let available = u64::from(host.cpu_count());
        properties.insert(Property::Vcpus, check_bound("vcpus", vcpus, available)?);
    }

    if let Some(mac) = &request.mac {
        properties.insert(Property::Mac, parse_mac(mac)?);
    }

    // Network and kernel references
    if let Some(netvm) = &request.netvm {
        let (value, uses_default) = resolve_netvm(Property::Netvm, netvm, request, registry)?;
        properties.insert(Property::Netvm, value);
        properties.insert(Property::UsesDefaultNetvm, PropertyValue::Bool(uses_default));
    }
    if let Some(dispvm_netvm) = &request.dispvm_netvm {
        let (value, uses_default) =
            resolve_netvm(Property::DispvmNetvm, dispvm_netvm, request, registry)?;
        properties.insert(Property::DispvmNetvm, value);
        properties.insert(Property::UsesDefaultDispvmNetvm, PropertyValue::Bool(uses_default));
    }
    if let Some(kernel) = &request.kernel {
        let (value, uses_default) = resolve_kernel(kernel, registry, host)?;
        properties.insert(Property::Kernel, value);
        properties.insert(Property::UsesDefaultKernel, PropertyValue::Bool(uses_default));
    }

    if let Some(timezone) = &request.timezone {
        properties.insert(Property::Timezone, PropertyValue::Timezone(parse_timezone(timezone)?));
    }

    // Plain scalars
    let flags = [
        (Property::Debug, request.debug),
        (Property::Autostart, request.autostart),
        (Property::IncludeInBackups, request.include_in_backups),
        (Property::Internal, request.internal),
        (Property::QrexecInstalled, request.qrexec_installed),
        (Property::GuiagentInstalled, request.guiagent_installed),
        (Property::SeamlessGuiMode, request.seamless_gui_mode),
        (Property::PciStrictreset, request.pci_strictreset),
        (Property::PciE820Host, request.pci_e820_host),
    ];
    for (property, value) in flags {
        if let Some(value) = value {
            properties.insert(property, PropertyValue::Bool(value));
        }
    }
    if let Some(kernelopts) = &request.kernelopts {
        properties.insert(Property::Kernelopts, PropertyValue::Text(kernelopts.clone()));
    }
    if let Some(user) = &request.default_user {
        properties.insert(Property::DefaultUser, PropertyValue::Text(user.clone()));
    }
    if let Some(timeout) = request.qrexec_timeout {
        properties.insert(Property::QrexecTimeout, PropertyValue::Int(timeout));
    }
    if let Some(drive) = &request.drive {
        properties.insert(Property::Drive, PropertyValue::Text(drive.clone()));
    }

    debug!(
        base_template = ?base_template,
        standalone,
        explicit = properties.len(),
        "Options resolved"
    );

    Ok(ResolvedOptions {
        name: request.name.clone(),
        kind: request.kind,
        base_template,
        template,
        standalone,
        pool: request.pool.clone(),
        properties,
    })
}

/// Properties the request sets explicitly, for the capability check.
fn requested_properties(request: &VmRequest) -> Vec<Property> {
    let set = [
        (Property::Template, request.template.is_some()),
        (Property::Netvm, request.netvm.is_some()),
        (Property::DispvmNetvm, request.dispvm_netvm.is_some()),
        (Property::Kernel, request.kernel.is_some()),
        (Property::Kernelopts, request.kernelopts.is_some()),
        (Property::Memory, request.memory.is_some()),
        (Property::Maxmem, request.maxmem.is_some()),
        (Property::Vcpus, request.vcpus.is_some()),
        (Property::Mac, request.mac.is_some()),
        (Property::Debug, request.debug.is_some()),
        (Property::Autostart, request.autostart.is_some()),
        (Property::IncludeInBackups, request.include_in_backups.is_some()),
        (Property::Internal, request.internal.is_some()),
        (Property::QrexecInstalled, request.qrexec_installed.is_some()),
        (Property::GuiagentInstalled, request.guiagent_installed.is_some()),
        (Property::SeamlessGuiMode, request.seamless_gui_mode.is_some()),
        (Property::PciStrictreset, request.pci_strictreset.is_some()),
        (Property::PciE820Host, request.pci_e820_host.is_some()),
        (Property::DefaultUser, request.default_user.is_some()),
        (Property::QrexecTimeout, request.qrexec_timeout.is_some()),
        (Property::Timezone, request.timezone.is_some()),
        (Property::Drive, request.drive.is_some()),
    ];
    set.into_iter()
        .filter_map(|(property, is_set)| is_set.then_some(property))
        .collect()
}

fn check_supported(request: &VmRequest, caps: &Capabilities) -> Result<(), ValidationError> {
    match requested_properties(request)
        .into_iter()
        .find(|p| !caps.supports(*p))
    {
        Some(property) => Err(ValidationError::UnsupportedProperty {
            property,
            kind: caps.kind,
        }),
        None => Ok(()),
    }
}

fn resolve_template(
    request: &VmRequest,
    registry: &Registry,
    caps: &Capabilities,
) -> Result<Option<Qid>, ValidationError> {
    match &request.template {
        Some(VmRef::Named(name)) => {
            let template = registry
                .by_name(name)
                .ok_or_else(|| ValidationError::TemplateNotFound(name.clone()))?;
            if !template.is_template() {
                return Err(ValidationError::NotATemplate(name.clone()));
            }
            Ok(Some(template.qid))
        }
        None | Some(VmRef::None) | Some(VmRef::Default) => {
            // The clone source only matters at creation.
            let existing_standalone =
                request.standalone == Some(true) && registry.by_name(&request.name).is_some();
            if !caps.uses_default_template || existing_standalone {
                return Ok(None);
            }
            registry
                .default_template()
                .map(Some)
                .ok_or_else(|| ValidationError::NoDefaultTemplate(request.name.clone()))
        }
    }
}

fn check_bound(resource: &'static str, requested: i64, available: u64) -> Result<PropertyValue, ValidationError> {
    match u64::try_from(requested) {
        Ok(value) if value > 0 && value <= available => Ok(PropertyValue::Int(value)),
        _ => Err(ValidationError::ResourceExceedsHost {
            resource,
            requested,
            available,
        }),
    }
}

fn check_memory(resource: &'static str, requested: i64, host: &dyn HostFacts) -> Result<PropertyValue, ValidationError> {
    check_bound(resource, requested, host.memory_total_mb())
}

/// `auto` clears the MAC; anything else must be `XX:XX:XX:XX:XX:XX`.
fn parse_mac(mac: &str) -> Result<PropertyValue, ValidationError> {
    if mac == "auto" {
        return Ok(PropertyValue::Null);
    }

    let invalid = || ValidationError::InvalidMacFormat(mac.to_string());
    let well_formed = mac.len() == 17
        && mac
            .split(':')
            .all(|pair| pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return Err(invalid());
    }

    let addr: macaddr::MacAddr6 = mac.parse().map_err(|_| invalid())?;
    let normalized = addr
        .as_bytes()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");
    Ok(PropertyValue::Text(normalized))
}

fn resolve_netvm(
    property: Property,
    reference: &VmRef,
    request: &VmRequest,
    registry: &Registry,
) -> Result<(PropertyValue, bool), ValidationError> {
    match reference {
        VmRef::None => Ok((PropertyValue::Null, false)),
        VmRef::Default => Ok((opt_vm(registry.default_netvm()), true)),
        VmRef::Named(name) => {
            let invalid = |reason| ValidationError::InvalidNetvmReference {
                property,
                target: name.clone(),
                reason,
            };
            if *name == request.name {
                return Err(invalid("a qube cannot route through itself"));
            }
            let netvm = registry.by_name(name).ok_or_else(|| invalid("no such qube"))?;
            if !netvm.is_netvm() {
                return Err(invalid("not a network-providing qube"));
            }
            Ok((PropertyValue::Vm(netvm.qid), false))
        }
    }
}

fn resolve_kernel(
    reference: &VmRef,
    registry: &Registry,
    host: &dyn HostFacts,
) -> Result<(PropertyValue, bool), ValidationError> {
    match reference {
        VmRef::None => Ok((PropertyValue::Null, false)),
        VmRef::Default => {
            let value = registry
                .default_kernel()
                .map(|k| PropertyValue::Text(k.to_string()))
                .unwrap_or(PropertyValue::Null);
            Ok((value, true))
        }
        VmRef::Named(name) => {
            if !host.kernel_installed(name) {
                return Err(ValidationError::KernelNotFound(name.clone()));
            }
            Ok((PropertyValue::Text(name.clone()), false))
        }
    }
}

fn parse_timezone(spec: &TimezoneSpec) -> Result<Timezone, ValidationError> {
    match spec {
        TimezoneSpec::Offset(offset) => Ok(Timezone::Offset(*offset)),
        TimezoneSpec::Name(name) => name
            .parse()
            .map_err(|_| ValidationError::InvalidTimezone(name.clone())),
    }
}

fn opt_vm(qid: Option<Qid>) -> PropertyValue {
    qid.map(PropertyValue::Vm).unwrap_or(PropertyValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::record;
    use qubesctl_telemetry::StaticHostFacts;

    fn host() -> StaticHostFacts {
        StaticHostFacts::new(8192, 4).with_kernel("4.4.14-11")
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.insert(record(1, "fedora-23", VmKind::TemplateVm)).unwrap();
        registry.insert(record(2, "sys-net", VmKind::NetVm)).unwrap();
        registry.insert(record(3, "work", VmKind::AppVm)).unwrap();
        registry.set_default_template(Some(1)).unwrap();
        registry.set_default_netvm(Some(2)).unwrap();
        registry
    }

    fn resolve_err(request: &VmRequest) -> ValidationError {
        resolve(request, &registry(), &host()).unwrap_err()
    }

    #[test]
    fn test_label_required_and_known() {
        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.label = None;
        assert!(matches!(resolve_err(&request), ValidationError::LabelRequired(_)));

        request.label = Some("pink".into());
        assert!(matches!(resolve_err(&request), ValidationError::UnknownLabel(l) if l == "pink"));
    }

    #[test]
    fn test_default_template_substituted() {
        let request = VmRequest::present("a", VmKind::AppVm, "red");
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(resolved.base_template, Some(1));
        assert_eq!(resolved.template, Some(1));
        assert!(!resolved.standalone);
        // Omitted template stays out of the diff table.
        assert_eq!(resolved.get(Property::Template), None);
        assert_eq!(resolved.get(Property::Label), Some(&PropertyValue::Label(Label::Red)));

        let mut empty = Registry::new();
        empty.insert(record(2, "sys-net", VmKind::NetVm)).unwrap();
        let err = resolve(&request, &empty, &host()).unwrap_err();
        assert!(matches!(err, ValidationError::NoDefaultTemplate(_)));
    }

    #[test]
    fn test_explicit_template_lookup() {
        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.template = Some(VmRef::from("debian-8"));
        assert!(matches!(resolve_err(&request), ValidationError::TemplateNotFound(_)));

        request.template = Some(VmRef::from("work"));
        assert!(matches!(resolve_err(&request), ValidationError::NotATemplate(_)));
    }

    #[test]
    fn test_standalone_derivation() {
        let hvm = resolve(&VmRequest::present("win", VmKind::Hvm, "blue"), &registry(), &host()).unwrap();
        assert!(hvm.standalone);
        assert_eq!(hvm.base_template, None);

        let mut request = VmRequest::present("win-t", VmKind::TemplateHvm, "blue");
        request.template = Some(VmRef::from("fedora-23"));
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert!(resolved.standalone);
        assert_eq!(resolved.base_template, Some(1));
        assert_eq!(resolved.template, None);
        assert_eq!(resolved.get(Property::Template), Some(&PropertyValue::Null));

        let mut request = VmRequest::present("copy", VmKind::AppVm, "red");
        request.standalone = Some(true);
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(resolved.base_template, Some(1));
        assert_eq!(resolved.template, None);
    }

    #[test]
    fn test_existing_standalone_needs_no_default_template() {
        let mut registry = Registry::new();
        registry.insert(record(2, "sys-net", VmKind::NetVm)).unwrap();
        let mut copy = record(3, "copy", VmKind::AppVm);
        copy.properties.template = None;
        registry.insert(copy).unwrap();

        let mut request = VmRequest::present("copy", VmKind::AppVm, "red");
        request.template = Some(VmRef::None);
        request.standalone = Some(true);
        let resolved = resolve(&request, &registry, &host()).unwrap();
        assert!(resolved.standalone);
        assert_eq!(resolved.base_template, None);
        assert_eq!(resolved.get(Property::Template), Some(&PropertyValue::Null));

        // Creating one still needs a clone source.
        request.name = "fresh".into();
        let err = resolve(&request, &registry, &host()).unwrap_err();
        assert!(matches!(err, ValidationError::NoDefaultTemplate(_)));
    }

    #[test]
    fn test_resource_bounds() {
        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.memory = Some(100_000);
        assert!(matches!(
            resolve_err(&request),
            ValidationError::ResourceExceedsHost { resource: "memory", .. }
        ));

        request.memory = Some(8192);
        request.vcpus = Some(0);
        assert!(matches!(
            resolve_err(&request),
            ValidationError::ResourceExceedsHost { resource: "vcpus", .. }
        ));

        request.vcpus = Some(4);
        request.maxmem = Some(-1);
        assert!(matches!(
            resolve_err(&request),
            ValidationError::ResourceExceedsHost { resource: "maxmem", .. }
        ));
    }

    #[test]
    fn test_mac_forms() {
        assert_eq!(parse_mac("auto").unwrap(), PropertyValue::Null);
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:0f").unwrap(),
            PropertyValue::Text("AA:BB:CC:DD:EE:0F".into())
        );
        for bad in ["not-a-mac", "AA-BB-CC-DD-EE-FF", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:GG"] {
            assert!(matches!(parse_mac(bad), Err(ValidationError::InvalidMacFormat(_))));
        }
    }

    #[test]
    fn test_netvm_references() {
        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.netvm = Some(VmRef::Default);
        request.dispvm_netvm = Some(VmRef::None);
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(resolved.get(Property::Netvm), Some(&PropertyValue::Vm(2)));
        assert_eq!(resolved.get(Property::UsesDefaultNetvm), Some(&PropertyValue::Bool(true)));
        assert_eq!(resolved.get(Property::DispvmNetvm), Some(&PropertyValue::Null));
        assert_eq!(
            resolved.get(Property::UsesDefaultDispvmNetvm),
            Some(&PropertyValue::Bool(false))
        );

        request.netvm = Some(VmRef::from("work"));
        assert!(matches!(resolve_err(&request), ValidationError::InvalidNetvmReference { .. }));

        let mut proxy = VmRequest::present("sys-firewall", VmKind::ProxyVm, "green");
        proxy.netvm = Some(VmRef::from("sys-firewall"));
        assert!(matches!(
            resolve(&proxy, &registry(), &host()).unwrap_err(),
            ValidationError::InvalidNetvmReference { .. }
        ));
    }

    #[test]
    fn test_kernel_references() {
        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.kernel = Some(VmRef::from("4.4.14-11"));
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(
            resolved.get(Property::Kernel),
            Some(&PropertyValue::Text("4.4.14-11".into()))
        );

        request.kernel = Some(VmRef::from("3.18.17-4"));
        assert!(matches!(resolve_err(&request), ValidationError::KernelNotFound(_)));

        // Unset registry default resolves to null.
        request.kernel = Some(VmRef::Default);
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(resolved.get(Property::Kernel), Some(&PropertyValue::Null));
    }

    #[test]
    fn test_timezone_and_unsupported_properties() {
        let mut request = VmRequest::present("win", VmKind::Hvm, "blue");
        request.timezone = Some(TimezoneSpec::Name("-3600".into()));
        let resolved = resolve(&request, &registry(), &host()).unwrap();
        assert_eq!(
            resolved.get(Property::Timezone),
            Some(&PropertyValue::Timezone(Timezone::Offset(-3600)))
        );

        request.timezone = Some(TimezoneSpec::Name("CET".into()));
        assert!(matches!(resolve_err(&request), ValidationError::InvalidTimezone(_)));

        let mut request = VmRequest::present("win", VmKind::Hvm, "blue");
        request.kernel = Some(VmRef::Default);
        assert!(matches!(
            resolve_err(&request),
            ValidationError::UnsupportedProperty { property: Property::Kernel, kind: VmKind::Hvm }
        ));

        let mut request = VmRequest::present("a", VmKind::AppVm, "red");
        request.timezone = Some(TimezoneSpec::Offset(0));
        assert!(matches!(resolve_err(&request), ValidationError::UnsupportedProperty { .. }));
    }
}
