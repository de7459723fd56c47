//! Memory information collection.

use serde::{Deserialize, Serialize};
use sysinfo::System;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Memory information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Total physical memory in MB
    pub total_mb: u64,
    /// Available memory in MB
    pub available_mb: u64,
}

/// Collect memory information from the system.
pub fn collect_memory_info(system: &System) -> MemoryInfo {
    MemoryInfo {
        total_mb: system.total_memory() / BYTES_PER_MB,
        available_mb: system.available_memory() / BYTES_PER_MB,
    }
}
