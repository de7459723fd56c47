//! Per-kind capabilities and the supported-property table.

use qubesctl_hypervisor::{Property, VmKind};

/// What a qube of a given kind can do and which properties it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub kind: VmKind,
    /// Other qubes may be based on it
    pub is_template: bool,
    /// Other qubes may route through it
    pub provides_network: bool,
    pub is_hvm: bool,
    /// Falls back to the registry default template when none is given
    pub uses_default_template: bool,
    /// Always owns its root image
    pub forced_standalone: bool,
    /// Boots a paravirtualized kernel
    pub has_kernel: bool,
    /// Has a netvm property at all
    pub uses_network: bool,
}

impl Capabilities {
    pub fn of(kind: VmKind) -> Self {
        Self {
            kind,
            is_template: kind.is_template(),
            provides_network: kind.provides_network(),
            is_hvm: kind.is_hvm(),
            uses_default_template: matches!(kind, VmKind::AppVm | VmKind::NetVm | VmKind::ProxyVm),
            forced_standalone: matches!(kind, VmKind::TemplateHvm | VmKind::TemplateVm),
            has_kernel: !kind.is_hvm(),
            uses_network: true,
        }
    }

    /// Whether qubes of this kind carry `property`.
    pub fn supports(&self, property: Property) -> bool {
        match property {
            Property::Kernel | Property::UsesDefaultKernel | Property::Kernelopts => self.has_kernel,
            Property::Drive
            | Property::GuiagentInstalled
            | Property::SeamlessGuiMode
            | Property::Timezone => self.is_hvm,
            Property::DispvmNetvm | Property::UsesDefaultDispvmNetvm => !self.is_template,
            _ => true,
        }
    }

    /// Properties of this kind, in diff order.
    pub fn supported_properties(&self) -> impl Iterator<Item = Property> + '_ {
        Property::ALL.into_iter().filter(move |p| self.supports(*p))
    }
}

/// Capability lookup on [`VmKind`].
pub trait KindCapabilities {
    fn capabilities(&self) -> Capabilities;
}

impl KindCapabilities for VmKind {
    fn capabilities(&self) -> Capabilities {
        Capabilities::of(*self)
    }
}
