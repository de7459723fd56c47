//! Desired-state requests as declared by the operator.

use std::fmt;

use qubesctl_hypervisor::VmKind;
use serde::{Deserialize, Serialize};

/// Whether a qube should exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

/// Reference to another qube (or kernel) as written in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VmRef {
    /// Explicitly nothing
    None,
    /// Whatever the registry default is
    Default,
    /// A qube or kernel by name
    Named(String),
}

impl From<String> for VmRef {
    fn from(s: String) -> Self {
        match s.as_str() {
            "none" => VmRef::None,
            "default" => VmRef::Default,
            _ => VmRef::Named(s),
        }
    }
}

impl From<&str> for VmRef {
    fn from(s: &str) -> Self {
        VmRef::from(s.to_string())
    }
}

impl From<VmRef> for String {
    fn from(r: VmRef) -> Self {
        match r {
            VmRef::None => "none".to_string(),
            VmRef::Default => "default".to_string(),
            VmRef::Named(name) => name,
        }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmRef::None => f.write_str("none"),
            VmRef::Default => f.write_str("default"),
            VmRef::Named(name) => f.write_str(name),
        }
    }
}

/// Timezone as written: `localtime`, or an offset given as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimezoneSpec {
    Offset(i64),
    Name(String),
}

/// Desired state of one qube.
///
/// Unset fields leave the corresponding property alone on an existing qube
/// and take the platform default on a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmRequest {
    pub name: String,
    #[serde(default)]
    pub kind: VmKind,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VmRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netvm: Option<VmRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispvm_netvm: Option<VmRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<VmRef>,
    /// Storage pool, only honored at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<bool>,

    /// Initial memory in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    /// Memory ceiling in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<i64>,
    /// `auto` or six colon-separated hex pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<TimezoneSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_in_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qrexec_installed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guiagent_installed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seamless_gui_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_strictreset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_e820_host: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelopts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qrexec_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive: Option<String>,
}

impl VmRequest {
    /// A present request with only name, kind and label set.
    pub fn present(name: impl Into<String>, kind: VmKind, label: &str) -> Self {
        Self {
            name: name.into(),
            kind,
            label: Some(label.to_string()),
            ..Default::default()
        }
    }

    /// A request to remove the qube.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DesiredState::Absent,
            ..Default::default()
        }
    }

    pub fn is_absent(&self) -> bool {
        self.state == DesiredState::Absent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_request() {
        let yaml = r#"
name: work
kind: appvm
label: blue
template: fedora-23
netvm: default
dispvm_netvm: none
memory: 800
mac: auto
timezone: localtime
include_in_backups: false
"#;
        let request: VmRequest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(request.name, "work");
        assert_eq!(request.state, DesiredState::Present);
        assert_eq!(request.template, Some(VmRef::Named("fedora-23".into())));
        assert_eq!(request.netvm, Some(VmRef::Default));
        assert_eq!(request.dispvm_netvm, Some(VmRef::None));
        assert_eq!(request.memory, Some(800));
        assert_eq!(request.timezone, Some(TimezoneSpec::Name("localtime".into())));
        assert_eq!(request.include_in_backups, Some(false));
        assert_eq!(request.kernel, None);
    }

    #[test]
    fn test_defaults_and_absent() {
        let request: VmRequest = serde_yaml::from_str("name: old\nstate: absent").unwrap();
        assert!(request.is_absent());
        assert_eq!(request.kind, VmKind::AppVm);
        assert_eq!(request.label, None);
    }

    #[test]
    fn test_integer_timezone_and_unknown_field() {
        let request: VmRequest = serde_yaml::from_str("name: win\nkind: hvm\ntimezone: 3600").unwrap();
        assert_eq!(request.timezone, Some(TimezoneSpec::Offset(3600)));

        assert!(serde_yaml::from_str::<VmRequest>("name: x\nmemroy: 400").is_err());
    }

    #[test]
    fn test_vm_ref_round_trips_as_string() {
        let yaml = serde_yaml::to_string(&VmRequest {
            netvm: Some(VmRef::None),
            ..VmRequest::present("work", VmKind::AppVm, "red")
        })
        .unwrap();
        assert!(yaml.contains("netvm: none"));
        assert!(!yaml.contains("memory"));
    }
}
