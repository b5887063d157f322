//! Resource accounting
//!
//! CPU speed detection and bandwidth conversion, per-task CPU percentage
//! tracking and the utilization snapshot reported for a task.

pub mod specs;
pub mod tracker;

pub use specs::CpuSpecs;
pub use tracker::{CpuPercent, CpuTracker};

use serde::{Deserialize, Serialize};

/// Point-in-time resource usage of one task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    /// `memory.current` in bytes
    pub memory: u64,
    /// `memory.swap.current` in bytes
    pub swap: u64,
    /// `file` field of `memory.stat` in bytes
    pub cache: u64,
    pub user: f64,
    pub system: f64,
    pub percent: f64,
    /// Achieved clock-equivalent in MHz
    pub ticks: f64,
}
