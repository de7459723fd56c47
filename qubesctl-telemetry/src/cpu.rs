//! CPU information collection.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// CPU information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    /// CPU model name
    pub model: String,
    /// Number of physical cores
    pub physical_cores: usize,
    /// Number of logical cores (threads)
    pub logical_cores: usize,
}

/// Collect CPU information from the system.
pub fn collect_cpu_info(system: &System) -> CpuInfo {
    let cpus = system.cpus();

    let model = cpus.first()
        .map(|cpu| cpu.brand().to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    CpuInfo {
        model,
        physical_cores: system.physical_core_count().unwrap_or(0),
        logical_cores: cpus.len(),
    }
}
