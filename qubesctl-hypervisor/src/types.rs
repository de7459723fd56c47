//! Type definitions for qube records and their properties.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HypervisorError, Result};

/// Stable numeric qube identifier.
pub type Qid = u32;

// =============================================================================
// VM KIND
// =============================================================================

/// Class of a qube. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VmKind {
    /// Template-based application qube
    #[serde(rename = "appvm")]
    AppVm,
    /// Network-providing qube with device access
    #[serde(rename = "netvm")]
    NetVm,
    /// Network-providing qube that routes through another netvm
    #[serde(rename = "proxyvm")]
    ProxyVm,
    /// Fully virtualized qube
    #[serde(rename = "hvm")]
    Hvm,
    /// Fully virtualized template
    #[serde(rename = "template-hvm", alias = "templatehvm")]
    TemplateHvm,
    /// Paravirtualized template owning its root image
    #[serde(rename = "template", alias = "standalone-template", alias = "templatevm")]
    TemplateVm,
}

impl VmKind {
    pub const ALL: [VmKind; 6] = [
        VmKind::AppVm,
        VmKind::NetVm,
        VmKind::ProxyVm,
        VmKind::Hvm,
        VmKind::TemplateHvm,
        VmKind::TemplateVm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmKind::AppVm => "appvm",
            VmKind::NetVm => "netvm",
            VmKind::ProxyVm => "proxyvm",
            VmKind::Hvm => "hvm",
            VmKind::TemplateHvm => "template-hvm",
            VmKind::TemplateVm => "template",
        }
    }

    /// Other qubes may be based on this one.
    pub fn is_template(&self) -> bool {
        matches!(self, VmKind::TemplateHvm | VmKind::TemplateVm)
    }

    /// Other qubes may use this one as their netvm.
    pub fn provides_network(&self) -> bool {
        matches!(self, VmKind::NetVm | VmKind::ProxyVm)
    }

    /// Fully virtualized (no paravirtualized kernel).
    pub fn is_hvm(&self) -> bool {
        matches!(self, VmKind::Hvm | VmKind::TemplateHvm)
    }
}

impl Default for VmKind {
    fn default() -> Self {
        Self::AppVm
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "appvm" => Ok(VmKind::AppVm),
            "netvm" => Ok(VmKind::NetVm),
            "proxyvm" => Ok(VmKind::ProxyVm),
            "hvm" => Ok(VmKind::Hvm),
            "template-hvm" | "templatehvm" => Ok(VmKind::TemplateHvm),
            "template" | "standalone-template" | "templatevm" => Ok(VmKind::TemplateVm),
            other => Err(format!("unknown qube kind: {}", other)),
        }
    }
}

// =============================================================================
// LABEL
// =============================================================================

/// Window border color of a qube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Red,
    Orange,
    Yellow,
    Green,
    Gray,
    Blue,
    Purple,
    Black,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Red => "red",
            Label::Orange => "orange",
            Label::Yellow => "yellow",
            Label::Green => "green",
            Label::Gray => "gray",
            Label::Blue => "blue",
            Label::Purple => "purple",
            Label::Black => "black",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "red" => Ok(Label::Red),
            "orange" => Ok(Label::Orange),
            "yellow" => Ok(Label::Yellow),
            "green" => Ok(Label::Green),
            "gray" => Ok(Label::Gray),
            "blue" => Ok(Label::Blue),
            "purple" => Ok(Label::Purple),
            "black" => Ok(Label::Black),
            other => Err(format!("unknown label: {}", other)),
        }
    }
}

// =============================================================================
// TIMEZONE
// =============================================================================

/// Guest clock setting for HVM qubes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    /// Follow the host's local time
    Localtime,
    /// Fixed offset from UTC, in seconds
    Offset(i64),
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timezone::Localtime => f.write_str("localtime"),
            Timezone::Offset(offset) => write!(f, "{}", offset),
        }
    }
}

impl FromStr for Timezone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "localtime" {
            return Ok(Timezone::Localtime);
        }
        s.parse::<i64>()
            .map(Timezone::Offset)
            .map_err(|_| format!("invalid timezone: {}", s))
    }
}

impl Serialize for Timezone {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Timezone::Localtime => serializer.serialize_str("localtime"),
            Timezone::Offset(offset) => serializer.serialize_i64(*offset),
        }
    }
}

impl<'de> Deserialize<'de> for Timezone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Offset(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Offset(offset) => Ok(Timezone::Offset(offset)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// PROPERTIES
// =============================================================================

/// Mutable qube property. The diff loop walks [`Property::ALL`] in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Property {
    Label,
    Template,
    Netvm,
    UsesDefaultNetvm,
    DispvmNetvm,
    UsesDefaultDispvmNetvm,
    Kernel,
    UsesDefaultKernel,
    Kernelopts,
    Memory,
    Maxmem,
    Vcpus,
    Mac,
    Debug,
    Autostart,
    IncludeInBackups,
    Internal,
    QrexecInstalled,
    GuiagentInstalled,
    SeamlessGuiMode,
    PciStrictreset,
    PciE820Host,
    DefaultUser,
    QrexecTimeout,
    Timezone,
    Drive,
}

impl Property {
    pub const ALL: [Property; 26] = [
        Property::Label,
        Property::Template,
        Property::Netvm,
        Property::UsesDefaultNetvm,
        Property::DispvmNetvm,
        Property::UsesDefaultDispvmNetvm,
        Property::Kernel,
        Property::UsesDefaultKernel,
        Property::Kernelopts,
        Property::Memory,
        Property::Maxmem,
        Property::Vcpus,
        Property::Mac,
        Property::Debug,
        Property::Autostart,
        Property::IncludeInBackups,
        Property::Internal,
        Property::QrexecInstalled,
        Property::GuiagentInstalled,
        Property::SeamlessGuiMode,
        Property::PciStrictreset,
        Property::PciE820Host,
        Property::DefaultUser,
        Property::QrexecTimeout,
        Property::Timezone,
        Property::Drive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Property::Label => "label",
            Property::Template => "template",
            Property::Netvm => "netvm",
            Property::UsesDefaultNetvm => "uses_default_netvm",
            Property::DispvmNetvm => "dispvm_netvm",
            Property::UsesDefaultDispvmNetvm => "uses_default_dispvm_netvm",
            Property::Kernel => "kernel",
            Property::UsesDefaultKernel => "uses_default_kernel",
            Property::Kernelopts => "kernelopts",
            Property::Memory => "memory",
            Property::Maxmem => "maxmem",
            Property::Vcpus => "vcpus",
            Property::Mac => "mac",
            Property::Debug => "debug",
            Property::Autostart => "autostart",
            Property::IncludeInBackups => "include_in_backups",
            Property::Internal => "internal",
            Property::QrexecInstalled => "qrexec_installed",
            Property::GuiagentInstalled => "guiagent_installed",
            Property::SeamlessGuiMode => "seamless_gui_mode",
            Property::PciStrictreset => "pci_strictreset",
            Property::PciE820Host => "pci_e820_host",
            Property::DefaultUser => "default_user",
            Property::QrexecTimeout => "qrexec_timeout",
            Property::Timezone => "timezone",
            Property::Drive => "drive",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a single [`Property`].
///
/// References to other qubes carry the qid, so equality is by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(u64),
    Text(String),
    Vm(Qid),
    Label(Label),
    Timezone(Timezone),
}

impl PropertyValue {
    fn vm(qid: Option<Qid>) -> Self {
        qid.map(PropertyValue::Vm).unwrap_or(PropertyValue::Null)
    }

    fn text(text: Option<&String>) -> Self {
        text.map(|t| PropertyValue::Text(t.clone())).unwrap_or(PropertyValue::Null)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("none"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Text(t) => f.write_str(t),
            PropertyValue::Vm(qid) => write!(f, "qid:{}", qid),
            PropertyValue::Label(label) => write!(f, "{}", label),
            PropertyValue::Timezone(tz) => write!(f, "{}", tz),
        }
    }
}

/// Full property set of a qube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProperties {
    pub label: Label,
    /// Template the qube is based on (None for standalone qubes and templates)
    pub template: Option<Qid>,
    pub netvm: Option<Qid>,
    pub uses_default_netvm: bool,
    pub dispvm_netvm: Option<Qid>,
    pub uses_default_dispvm_netvm: bool,
    pub kernel: Option<String>,
    pub uses_default_kernel: bool,
    pub kernelopts: String,
    /// Initial memory in MB
    pub memory: u64,
    /// Memory balancing ceiling in MB
    pub maxmem: u64,
    pub vcpus: u64,
    /// Fixed MAC address (None lets the platform assign one)
    pub mac: Option<String>,
    pub debug: bool,
    pub autostart: bool,
    pub include_in_backups: bool,
    pub internal: bool,
    pub qrexec_installed: bool,
    pub guiagent_installed: bool,
    pub seamless_gui_mode: bool,
    pub pci_strictreset: bool,
    pub pci_e820_host: bool,
    pub default_user: String,
    /// Seconds to wait for qrexec at startup
    pub qrexec_timeout: u64,
    pub timezone: Timezone,
    /// Extra drive attached to an HVM (e.g. `cdrom:dom0:/path.iso`)
    pub drive: Option<String>,
}

impl VmProperties {
    /// Platform defaults for a freshly created qube of `kind`.
    pub fn defaults_for(kind: VmKind, label: Label) -> Self {
        let (memory, maxmem) = match kind {
            VmKind::NetVm | VmKind::ProxyVm => (300, 300),
            VmKind::Hvm | VmKind::TemplateHvm => (512, 512),
            _ => (400, 4000),
        };
        let kernelopts = match kind {
            VmKind::NetVm => "nopat iommu=soft swiotlb=8192",
            VmKind::Hvm | VmKind::TemplateHvm => "",
            _ => "nopat",
        };

        Self {
            label,
            template: None,
            netvm: None,
            uses_default_netvm: false,
            dispvm_netvm: None,
            uses_default_dispvm_netvm: false,
            kernel: None,
            uses_default_kernel: false,
            kernelopts: kernelopts.to_string(),
            memory,
            maxmem,
            vcpus: 2,
            mac: None,
            debug: false,
            autostart: false,
            include_in_backups: true,
            internal: false,
            qrexec_installed: !kind.is_hvm(),
            guiagent_installed: false,
            seamless_gui_mode: false,
            pci_strictreset: true,
            pci_e820_host: true,
            default_user: "user".to_string(),
            qrexec_timeout: 60,
            timezone: Timezone::Localtime,
            drive: None,
        }
    }

    /// Read a property as a tagged value.
    pub fn get(&self, property: Property) -> PropertyValue {
        match property {
            Property::Label => PropertyValue::Label(self.label),
            Property::Template => PropertyValue::vm(self.template),
            Property::Netvm => PropertyValue::vm(self.netvm),
            Property::UsesDefaultNetvm => PropertyValue::Bool(self.uses_default_netvm),
            Property::DispvmNetvm => PropertyValue::vm(self.dispvm_netvm),
            Property::UsesDefaultDispvmNetvm => PropertyValue::Bool(self.uses_default_dispvm_netvm),
            Property::Kernel => PropertyValue::text(self.kernel.as_ref()),
            Property::UsesDefaultKernel => PropertyValue::Bool(self.uses_default_kernel),
            Property::Kernelopts => PropertyValue::Text(self.kernelopts.clone()),
            Property::Memory => PropertyValue::Int(self.memory),
            Property::Maxmem => PropertyValue::Int(self.maxmem),
            Property::Vcpus => PropertyValue::Int(self.vcpus),
            Property::Mac => PropertyValue::text(self.mac.as_ref()),
            Property::Debug => PropertyValue::Bool(self.debug),
            Property::Autostart => PropertyValue::Bool(self.autostart),
            Property::IncludeInBackups => PropertyValue::Bool(self.include_in_backups),
            Property::Internal => PropertyValue::Bool(self.internal),
            Property::QrexecInstalled => PropertyValue::Bool(self.qrexec_installed),
            Property::GuiagentInstalled => PropertyValue::Bool(self.guiagent_installed),
            Property::SeamlessGuiMode => PropertyValue::Bool(self.seamless_gui_mode),
            Property::PciStrictreset => PropertyValue::Bool(self.pci_strictreset),
            Property::PciE820Host => PropertyValue::Bool(self.pci_e820_host),
            Property::DefaultUser => PropertyValue::Text(self.default_user.clone()),
            Property::QrexecTimeout => PropertyValue::Int(self.qrexec_timeout),
            Property::Timezone => PropertyValue::Timezone(self.timezone),
            Property::Drive => PropertyValue::text(self.drive.as_ref()),
        }
    }

    /// Write a property from a tagged value.
    ///
    /// Fails with [`HypervisorError::PropertyRejected`] when the value's tag
    /// does not fit the property.
    pub fn set(&mut self, property: Property, value: PropertyValue) -> Result<()> {
        use PropertyValue as V;

        match (property, value) {
            (Property::Label, V::Label(label)) => self.label = label,
            (Property::Template, V::Vm(qid)) => self.template = Some(qid),
            (Property::Template, V::Null) => self.template = None,
            (Property::Netvm, V::Vm(qid)) => self.netvm = Some(qid),
            (Property::Netvm, V::Null) => self.netvm = None,
            (Property::UsesDefaultNetvm, V::Bool(b)) => self.uses_default_netvm = b,
            (Property::DispvmNetvm, V::Vm(qid)) => self.dispvm_netvm = Some(qid),
            (Property::DispvmNetvm, V::Null) => self.dispvm_netvm = None,
            (Property::UsesDefaultDispvmNetvm, V::Bool(b)) => self.uses_default_dispvm_netvm = b,
            (Property::Kernel, V::Text(name)) => self.kernel = Some(name),
            (Property::Kernel, V::Null) => self.kernel = None,
            (Property::UsesDefaultKernel, V::Bool(b)) => self.uses_default_kernel = b,
            (Property::Kernelopts, V::Text(opts)) => self.kernelopts = opts,
            (Property::Memory, V::Int(mb)) => self.memory = mb,
            (Property::Maxmem, V::Int(mb)) => self.maxmem = mb,
            (Property::Vcpus, V::Int(n)) => self.vcpus = n,
            (Property::Mac, V::Text(mac)) => self.mac = Some(mac),
            (Property::Mac, V::Null) => self.mac = None,
            (Property::Debug, V::Bool(b)) => self.debug = b,
            (Property::Autostart, V::Bool(b)) => self.autostart = b,
            (Property::IncludeInBackups, V::Bool(b)) => self.include_in_backups = b,
            (Property::Internal, V::Bool(b)) => self.internal = b,
            (Property::QrexecInstalled, V::Bool(b)) => self.qrexec_installed = b,
            (Property::GuiagentInstalled, V::Bool(b)) => self.guiagent_installed = b,
            (Property::SeamlessGuiMode, V::Bool(b)) => self.seamless_gui_mode = b,
            (Property::PciStrictreset, V::Bool(b)) => self.pci_strictreset = b,
            (Property::PciE820Host, V::Bool(b)) => self.pci_e820_host = b,
            (Property::DefaultUser, V::Text(user)) => self.default_user = user,
            (Property::QrexecTimeout, V::Int(secs)) => self.qrexec_timeout = secs,
            (Property::Timezone, V::Timezone(tz)) => self.timezone = tz,
            (Property::Drive, V::Text(drive)) => self.drive = Some(drive),
            (Property::Drive, V::Null) => self.drive = None,
            (property, value) => {
                return Err(HypervisorError::PropertyRejected(format!(
                    "{} cannot be set to {}",
                    property, value
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// Authoritative state of an existing qube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub qid: Qid,
    pub name: String,
    pub kind: VmKind,
    /// Storage pool holding the qube's images
    pub pool: String,
    #[serde(default)]
    pub is_running: bool,
    /// Installed and owned by the package manager
    #[serde(default)]
    pub installed_by_rpm: bool,
    pub properties: VmProperties,
}

impl VmRecord {
    pub fn is_template(&self) -> bool {
        self.kind.is_template()
    }

    pub fn is_netvm(&self) -> bool {
        self.kind.provides_network()
    }
}

/// Everything a backend needs to create a qube.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub qid: Qid,
    pub name: String,
    pub kind: VmKind,
    pub pool: String,
    pub properties: VmProperties,
}

impl NewVm {
    /// The record a backend reports after a successful creation.
    pub fn into_record(self) -> VmRecord {
        VmRecord {
            qid: self.qid,
            name: self.name,
            kind: self.kind,
            pool: self.pool,
            is_running: false,
            installed_by_rpm: false,
            properties: self.properties,
        }
    }
}
