//! Cgroup resource governance
//!
//! Cgroup v2 only: limits are written into, and usage read from, the task
//! cgroup directory handed over by the orchestrator.

pub mod backend;
pub mod v2;

// Re-export commonly used items
pub use backend::{CgroupBackend, CpuUsage, MemoryUsage};
pub use v2::CgroupV2;
