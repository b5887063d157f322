//! Host CPU speed and cgroup bandwidth conversion.
//!
//! The speed is resolved once (from explicit compute or host detection) and
//! shared read-only by every supervisor as an `Arc<CpuSpecs>`.

use crate::config::types::{Result, SandboxError};
use std::fs;

/// Default `cpu.max` period in microseconds.
pub const CPU_PERIOD_USEC: u64 = 100_000;

const MAX_FREQ_PATH: &str = "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq";
const CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSpecs {
    /// Total compute across all cores in MHz
    total_mhz: u64,
    /// Logical core count
    cores: u32,
}

impl CpuSpecs {
    /// Build from an explicit total compute figure.
    pub fn from_compute(total_mhz: u64, cores: u32) -> Result<Self> {
        if cores == 0 || total_mhz < cores as u64 {
            return Err(SandboxError::Config(format!(
                "invalid cpu compute: {} MHz over {} cores",
                total_mhz, cores
            )));
        }
        Ok(Self { total_mhz, cores })
    }

    /// Detect speed and core count from sysfs and `/proc/cpuinfo`.
    pub fn detect() -> Result<Self> {
        let max_freq = fs::read_to_string(MAX_FREQ_PATH).ok();
        let cpuinfo = fs::read_to_string(CPUINFO_PATH)
            .map_err(|e| SandboxError::Config(format!("Failed to read {}: {}", CPUINFO_PATH, e)))?;
        let specs = Self::parse(max_freq.as_deref(), &cpuinfo)?;
        log::info!(
            "Detected host cpu: {} cores at {} MHz",
            specs.cores,
            specs.per_core_mhz()
        );
        Ok(specs)
    }

    /// `max_freq` is the sysfs value in kHz; `cpuinfo` is the contents of
    /// `/proc/cpuinfo`, used for the core count and as the speed fallback.
    pub fn parse(max_freq: Option<&str>, cpuinfo: &str) -> Result<Self> {
        let mut mhz = max_freq
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|khz| khz / 1000)
            .unwrap_or(0);

        let mut cores = 0u32;
        let mut fallback = 0u64;
        for line in cpuinfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "processor" => cores += 1,
                "cpu MHz" => {
                    let whole = value.trim().split('.').next().unwrap_or("");
                    if let Ok(v) = whole.parse::<u64>() {
                        fallback = fallback.max(v);
                    }
                }
                _ => {}
            }
        }

        if mhz == 0 {
            mhz = fallback;
        }
        if mhz == 0 || cores == 0 {
            return Err(SandboxError::Config(
                "unable to detect cpu speed and core count".to_string(),
            ));
        }
        Self::from_compute(mhz * cores as u64, cores)
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn total_mhz(&self) -> u64 {
        self.total_mhz
    }

    pub fn per_core_mhz(&self) -> u64 {
        self.total_mhz / self.cores as u64
    }

    /// `cpu.max` quota for a requested clock speed.
    pub fn bandwidth(&self, mhz: u64) -> u64 {
        mhz.saturating_mul(CPU_PERIOD_USEC) / self.per_core_mhz()
    }

    /// Achieved clock rate for a total CPU percentage.
    pub fn ticks(&self, total_percent: f64) -> f64 {
        0.01 * total_percent * self.per_core_mhz() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUINFO: &str = "processor\t: 0\nmodel name\t: Test CPU\ncpu MHz\t\t: 2399.998\n\n\
processor\t: 1\nmodel name\t: Test CPU\ncpu MHz\t\t: 3100.012\n";

    #[test]
    fn test_bandwidth_full_core() {
        let specs = CpuSpecs::from_compute(12_000, 4).unwrap();
        assert_eq!(specs.per_core_mhz(), 3000);
        assert_eq!(specs.bandwidth(3000), CPU_PERIOD_USEC);
        assert_eq!(specs.bandwidth(1500), 50_000);
    }

    #[test]
    fn test_bandwidth_monotonic() {
        let specs = CpuSpecs::from_compute(10_000, 4).unwrap();
        let mut last = 0;
        for mhz in (0..10_000).step_by(37) {
            let quota = specs.bandwidth(mhz);
            assert!(quota >= last, "bandwidth decreased at {} MHz", mhz);
            last = quota;
        }
    }

    #[test]
    fn test_ticks() {
        let specs = CpuSpecs::from_compute(8_000, 4).unwrap();
        assert!((specs.ticks(50.0) - 1000.0).abs() < f64::EPSILON);
        assert_eq!(specs.ticks(0.0), 0.0);
    }

    #[test]
    fn test_parse_prefers_max_freq() {
        let specs = CpuSpecs::parse(Some("3500000\n"), CPUINFO).unwrap();
        assert_eq!(specs.cores(), 2);
        assert_eq!(specs.per_core_mhz(), 3500);
    }

    #[test]
    fn test_parse_falls_back_to_fastest_core() {
        let specs = CpuSpecs::parse(None, CPUINFO).unwrap();
        assert_eq!(specs.cores(), 2);
        assert_eq!(specs.per_core_mhz(), 3100);
        assert_eq!(specs.total_mhz(), 6200);
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(CpuSpecs::parse(None, "").is_err());
        assert!(CpuSpecs::from_compute(1000, 0).is_err());
    }
}
