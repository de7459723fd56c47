//! Subcommand handlers.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use qubesctl_engine::{
    dump_registry, DefaultsUpdate, FileRegistryStore, Orchestrator, QubesDocument, RegistryStore,
    VmRef, VmRequest,
};
use qubesctl_hypervisor::{LocalBackend, MockBackend, VmManager};
use qubesctl_telemetry::SysinfoHostFacts;
use serde::Deserialize;
use tracing::{error, info};

use crate::cli::Command;
use crate::config::{Config, HypervisorBackend};

/// Accepted layouts of an apply file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RequestFile {
    Document(QubesDocument),
    List(Vec<VmRequest>),
    Single(VmRequest),
}

impl RequestFile {
    pub fn into_requests(self) -> Vec<VmRequest> {
        match self {
            RequestFile::Document(doc) => doc.qubes_vms,
            RequestFile::List(list) => list,
            RequestFile::Single(request) => vec![request],
        }
    }
}

/// Parse an apply file.
pub fn read_requests(path: &Path) -> Result<Vec<VmRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file: {}", path.display()))?;
    let file: RequestFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse request file: {}", path.display()))?;
    Ok(file.into_requests())
}

/// Wire the engine to the configured registry, backend and host.
pub fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let store = Arc::new(
        FileRegistryStore::new(&config.registry.path)
            .with_lock_timeout(Duration::from_millis(config.registry.lock_timeout_ms)),
    );

    let manager: Arc<dyn VmManager> = match config.hypervisor.backend {
        HypervisorBackend::Local => Arc::new(
            LocalBackend::with_path(&config.hypervisor.storage_path)
                .with_private_size(config.hypervisor.default_private_size_mib),
        ),
        HypervisorBackend::Mock => {
            // The mock starts empty; mirror the registry so updates have something to act on.
            let mock = MockBackend::new();
            let registry = store
                .load()
                .context("Failed to load registry for the mock backend")?;
            for record in registry.iter() {
                mock.adopt(record)?;
            }
            Arc::new(mock)
        }
    };

    let host = Arc::new(SysinfoHostFacts::with_kernels_dir(&config.host.kernels_dir));

    info!(
        registry = %config.registry.path,
        backend = manager.name(),
        "Engine configured"
    );
    Ok(Orchestrator::new(store, manager, host))
}

/// Run one subcommand, writing its report to `out`.
pub fn run(command: &Command, config: &Config, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Host => host(config, out),
        Command::Apply { file } => {
            let requests = read_requests(file)?;
            apply(&build_orchestrator(config)?, &requests, out)
        }
        Command::Remove { name } => apply(
            &build_orchestrator(config)?,
            &[VmRequest::absent(name.clone())],
            out,
        ),
        Command::Dump => dump(&build_orchestrator(config)?, out),
        Command::SetDefault {
            template,
            netvm,
            kernel,
        } => {
            let update = DefaultsUpdate {
                template: template.as_deref().map(VmRef::from),
                netvm: netvm.as_deref().map(VmRef::from),
                kernel: kernel.as_deref().map(VmRef::from),
            };
            build_orchestrator(config)?.set_defaults(&update)?;
            writeln!(out, "defaults updated")?;
            Ok(())
        }
    }
}

/// Apply requests one transaction at a time, stopping at the first failure.
pub fn apply(orchestrator: &Orchestrator, requests: &[VmRequest], out: &mut dyn Write) -> Result<()> {
    for request in requests {
        match orchestrator.apply(request) {
            Ok(outcome) => {
                let status = if outcome.changed { "changed" } else { "ok" };
                writeln!(out, "{}: {}", outcome.name, status)?;
            }
            Err(e) => {
                error!(vm_name = %request.name, error = %e, "Request failed");
                writeln!(out, "{}: failed", request.name)?;
                return Err(e).with_context(|| format!("Failed to apply '{}'", request.name));
            }
        }
    }
    Ok(())
}

fn dump(orchestrator: &Orchestrator, out: &mut dyn Write) -> Result<()> {
    let registry = orchestrator.registry()?;
    let document = QubesDocument {
        qubes_vms: dump_registry(&registry),
    };
    let yaml = serde_yaml::to_string(&document).context("Failed to encode dump")?;
    out.write_all(yaml.as_bytes())?;
    Ok(())
}

fn host(config: &Config, out: &mut dyn Write) -> Result<()> {
    let facts = SysinfoHostFacts::with_kernels_dir(&config.host.kernels_dir);
    let summary = facts.summary();

    writeln!(out, "cpu_model={}", summary.cpu.model)?;
    writeln!(out, "cpu_physical_cores={}", summary.cpu.physical_cores)?;
    writeln!(out, "cpu_logical_cores={}", summary.cpu.logical_cores)?;
    writeln!(out, "memory_total_mb={}", summary.memory.total_mb)?;
    writeln!(out, "memory_available_mb={}", summary.memory.available_mb)?;
    writeln!(out, "kernels_dir={}", facts.kernels_dir().display())?;
    writeln!(out, "kernels={}", summary.kernels.join(","))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_file_layouts() {
        let single: RequestFile = serde_yaml::from_str("name: work\nlabel: red").unwrap();
        assert_eq!(single.into_requests().len(), 1);

        let list: RequestFile =
            serde_yaml::from_str("- name: a\n  label: red\n- name: b\n  state: absent").unwrap();
        assert_eq!(list.into_requests().len(), 2);

        let doc: RequestFile =
            serde_yaml::from_str("qubes_vms:\n  - name: a\n    label: red").unwrap();
        let requests = doc.into_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "a");
    }
}
