/// Cgroup v2 backend bound to one task cgroup directory
///
/// File contract: `cpu.max`, `memory.max`, `memory.low` and `cgroup.kill` are
/// written; `memory.current`, `memory.swap.current`, `memory.stat`,
/// `cpu.stat` and `pids.current` are read.
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::{CgroupBackend, CpuUsage, MemoryUsage};
use crate::resources::specs::CPU_PERIOD_USEC;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/// Cgroup v2 backend
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CgroupV2 { path: path.into() }
    }

    fn read(&self, file: &str) -> Result<String> {
        let path = self.path.join(file);
        let content = fs::read_to_string(&path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read {}: {}", file, e)))?;
        Ok(content.trim().to_string())
    }

    fn read_u64(&self, file: &str) -> Result<u64> {
        let content = self.read(file)?;
        if content.is_empty() {
            return Ok(0);
        }
        content
            .parse::<u64>()
            .map_err(|e| SandboxError::Cgroup(format!("Failed to parse {}: {}", file, e)))
    }

    /// Control files already exist in a cgroup; never create them.
    fn write(&self, file: &str, content: &str) -> Result<()> {
        let path = self.path.join(file);
        let mut f = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to open {}: {}", file, e)))?;
        f.write_all(content.as_bytes())
            .map_err(|e| SandboxError::Cgroup(format!("Failed to write {}: {}", file, e)))
    }
}

/// Value of `key` in a flat-keyed cgroup file such as `memory.stat`.
pub fn flat_keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

impl CgroupBackend for CgroupV2 {
    fn path(&self) -> &Path {
        &self.path
    }

    fn open_descriptor(&self) -> Result<OwnedFd> {
        let fd = open(
            &self.path,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| {
            SandboxError::Cgroup(format!("Failed to open {}: {}", self.path.display(), e))
        })?;
        // SAFETY: fd was just returned by open(2) and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn set_cpu_bandwidth(&self, quota: u64) -> Result<()> {
        self.write("cpu.max", &format!("{} {}", quota, CPU_PERIOD_USEC))
    }

    fn set_memory_limits(&self, memory: u64, memory_max: u64) -> Result<()> {
        if memory_max == 0 {
            return self.write("memory.max", &memory.to_string());
        }
        self.write("memory.low", &memory.to_string())?;
        self.write("memory.max", &memory_max.to_string())
    }

    fn memory_usage(&self) -> Result<MemoryUsage> {
        // swap accounting and memory.stat may be disabled; only memory.current is required
        let cache = self
            .read("memory.stat")
            .ok()
            .and_then(|stat| flat_keyed_value(&stat, "file"))
            .unwrap_or(0);
        Ok(MemoryUsage {
            current: self.read_u64("memory.current")?,
            swap: self.read_u64("memory.swap.current").unwrap_or(0),
            cache,
        })
    }

    fn cpu_usage(&self) -> Result<CpuUsage> {
        let stat = self.read("cpu.stat")?;
        Ok(CpuUsage {
            user_usec: flat_keyed_value(&stat, "user_usec").unwrap_or(0),
            system_usec: flat_keyed_value(&stat, "system_usec").unwrap_or(0),
            usage_usec: flat_keyed_value(&stat, "usage_usec").unwrap_or(0),
        })
    }

    fn process_count(&self) -> Result<u64> {
        self.read_u64("pids.current")
    }

    fn kill_all(&self) -> Result<()> {
        log::warn!("Force killing cgroup {}", self.path.display());
        self.write("cgroup.kill", "1")
    }
}
