//! # qubesctl Telemetry
//!
//! Host facts consumed by qube validation: total memory, CPU count and the
//! set of installed VM kernels.
//!
//! The engine only depends on the [`HostFacts`] trait. [`SysinfoHostFacts`]
//! reads the running host; [`StaticHostFacts`] returns fixed values and is
//! meant for tests and dry runs.

pub mod cpu;
pub mod memory;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

/// Default location of installed VM kernels, one directory per version.
pub const DEFAULT_KERNELS_DIR: &str = "/var/lib/qubes/vm-kernels";

/// Facts about the virtualization host.
pub trait HostFacts {
    /// Total physical memory in MB.
    fn memory_total_mb(&self) -> u64;

    /// Number of logical CPUs.
    fn cpu_count(&self) -> u32;

    /// Whether a VM kernel with this name is installed.
    fn kernel_installed(&self, name: &str) -> bool;
}

/// Snapshot of host facts, printable by the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSummary {
    pub cpu: cpu::CpuInfo,
    pub memory: memory::MemoryInfo,
    pub kernels: Vec<String>,
}

/// Host facts collected with `sysinfo`.
///
/// Memory and CPU figures are sampled once at construction; a reconciliation
/// run is short enough that they do not need refreshing.
pub struct SysinfoHostFacts {
    system: System,
    kernels_dir: PathBuf,
}

impl SysinfoHostFacts {
    /// Sample the host using the default kernels directory.
    pub fn new() -> Self {
        Self::with_kernels_dir(DEFAULT_KERNELS_DIR)
    }

    /// Sample the host, looking for kernels under `kernels_dir`.
    pub fn with_kernels_dir(kernels_dir: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything())
        );

        let kernels_dir = kernels_dir.into();
        debug!(
            total_memory = system.total_memory(),
            cpus = system.cpus().len(),
            kernels_dir = %kernels_dir.display(),
            "Host facts sampled"
        );

        Self { system, kernels_dir }
    }

    /// Directory searched for installed kernels.
    pub fn kernels_dir(&self) -> &Path {
        &self.kernels_dir
    }

    /// Names of installed kernels (directories holding a `vmlinuz`).
    pub fn installed_kernels(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.kernels_dir) else {
            return Vec::new();
        };

        let mut kernels: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join("vmlinuz").is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        kernels.sort();
        kernels
    }

    /// Collect a printable summary of the host.
    pub fn summary(&self) -> HostSummary {
        HostSummary {
            cpu: cpu::collect_cpu_info(&self.system),
            memory: memory::collect_memory_info(&self.system),
            kernels: self.installed_kernels(),
        }
    }
}

impl Default for SysinfoHostFacts {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFacts for SysinfoHostFacts {
    fn memory_total_mb(&self) -> u64 {
        memory::collect_memory_info(&self.system).total_mb
    }

    fn cpu_count(&self) -> u32 {
        self.system.cpus().len() as u32
    }

    fn kernel_installed(&self, name: &str) -> bool {
        // Names are single path components; anything else cannot be a kernel.
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return false;
        }
        self.kernels_dir.join(name).join("vmlinuz").is_file()
    }
}

/// Fixed host facts.
#[derive(Debug, Clone)]
pub struct StaticHostFacts {
    pub memory_total_mb: u64,
    pub cpu_count: u32,
    pub kernels: BTreeSet<String>,
}

impl StaticHostFacts {
    pub fn new(memory_total_mb: u64, cpu_count: u32) -> Self {
        Self {
            memory_total_mb,
            cpu_count,
            kernels: BTreeSet::new(),
        }
    }

    /// Add an installed kernel.
    pub fn with_kernel(mut self, name: impl Into<String>) -> Self {
        self.kernels.insert(name.into());
        self
    }
}

impl HostFacts for StaticHostFacts {
    fn memory_total_mb(&self) -> u64 {
        self.memory_total_mb
    }

    fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    fn kernel_installed(&self, name: &str) -> bool {
        self.kernels.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_facts() {
        let host = StaticHostFacts::new(8192, 4).with_kernel("4.4.14-11");
        assert_eq!(host.memory_total_mb(), 8192);
        assert_eq!(host.cpu_count(), 4);
        assert!(host.kernel_installed("4.4.14-11"));
        assert!(!host.kernel_installed("3.18.17-4"));
    }

    #[test]
    fn test_sysinfo_kernel_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("4.4.14-11")).unwrap();
        std::fs::write(dir.path().join("4.4.14-11").join("vmlinuz"), b"").unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();

        let host = SysinfoHostFacts::with_kernels_dir(dir.path());
        assert!(host.kernel_installed("4.4.14-11"));
        assert!(!host.kernel_installed("broken"));
        assert!(!host.kernel_installed("../4.4.14-11"));
        assert_eq!(host.installed_kernels(), vec!["4.4.14-11".to_string()]);
    }

    #[test]
    fn test_sysinfo_reports_some_capacity() {
        let host = SysinfoHostFacts::new();
        assert!(host.cpu_count() >= 1);
        assert!(host.memory_total_mb() > 0);
    }
}
