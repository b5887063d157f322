//! Cgroup backend abstraction.

use crate::config::types::Result;
use std::os::fd::OwnedFd;
use std::path::Path;

/// Memory figures read from one cgroup, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub current: u64,
    pub swap: u64,
    pub cache: u64,
}

/// Cumulative CPU counters from `cpu.stat`, in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuUsage {
    pub user_usec: u64,
    pub system_usec: u64,
    pub usage_usec: u64,
}

/// Control surface of a single task cgroup.
pub trait CgroupBackend: Send + Sync {
    fn path(&self) -> &Path;
    /// Open the cgroup directory for `CLONE_INTO_CGROUP`.
    fn open_descriptor(&self) -> Result<OwnedFd>;
    /// Write `cpu.max` as `<quota> 100000`.
    fn set_cpu_bandwidth(&self, quota: u64) -> Result<()>;
    /// Write `memory.max`, plus `memory.low` when a ceiling is configured.
    fn set_memory_limits(&self, memory: u64, memory_max: u64) -> Result<()>;
    fn memory_usage(&self) -> Result<MemoryUsage>;
    fn cpu_usage(&self) -> Result<CpuUsage>;
    /// Number of live processes (`pids.current`).
    fn process_count(&self) -> Result<u64>;
    /// Terminate every process in the cgroup (`cgroup.kill`).
    fn kill_all(&self) -> Result<()>;
}

/// Detect whether the unified (v2) hierarchy is mounted.
pub fn cgroup_v2_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}
