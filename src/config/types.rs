/// Core types and structures for the taskbox system
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the recovery file written by the sandbox entrypoint, relative to
/// `<task_dir>/local`.
pub const EXIT_STATUS_FILE: &str = ".exit_status.txt";

/// Sentinel exit code for "unknown / error".
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// What to run inside the sandbox. Immutable once a task starts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Command to execute (resolved against PATH inside the sandbox)
    pub command: String,
    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Filesystem allow-list in `mode:path` form
    #[serde(default)]
    pub unveil_paths: Vec<String>,
    /// Also allow the OS default paths (binaries, libraries, devices)
    #[serde(default)]
    pub unveil_defaults: bool,
}

/// Resolved runtime parameters for one supervised task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Environment {
    /// User the command runs as
    pub user: String,
    /// Named pipe for standard output
    pub out_pipe: PathBuf,
    /// Named pipe for standard error
    pub err_pipe: PathBuf,
    /// Environment variables handed to the sandbox
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Task directory (working directory of the sandbox)
    pub task_dir: PathBuf,
    /// Task cgroup directory (cgroup v2)
    pub cgroup: PathBuf,
    /// Pre-built network namespace handle to enter, if any
    #[serde(default)]
    pub network_namespace: Option<PathBuf>,
    /// Memory in bytes (hard limit, or soft limit when `memory_max` is set)
    pub memory: u64,
    /// Memory ceiling in bytes, 0 when oversubscription is disabled
    #[serde(default)]
    pub memory_max: u64,
    /// `cpu.max` quota for a 100000us period
    pub cpu_bandwidth: u64,
    /// OOM score adjustment applied to the sandbox process, 0 leaves it alone
    #[serde(default)]
    pub oom_score_adj: i32,
}

/// Location of the recovery file for a task directory.
pub fn exit_status_path(task_dir: &Path) -> PathBuf {
    task_dir.join("local").join(EXIT_STATUS_FILE)
}

/// Terminal outcome of a task. Produced exactly once per task lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Exit code; 128 + signal for signal terminations, -1 when unknown
    pub exit_code: i32,
    /// Signal that killed the observed process, 0 if none
    pub signal: i32,
    /// Failure description, `None` on a clean exit
    pub err: Option<String>,
}

impl ExitResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: 0,
            err: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: 128 + signal,
            signal,
            err: None,
        }
    }

    pub fn failed(err: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_CODE_UNKNOWN,
            signal: 0,
            err: Some(err.into()),
        }
    }

    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.err.is_none()
    }
}

/// Task lifecycle state. `Exited` and `Unknown` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Exited,
    Unknown,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Exited => write!(f, "exited"),
            TaskState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error types for taskbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Unveil error: {0}")]
    Unveil(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("task does not exist: {0}")]
    TaskNotFound(String),

    #[error("task with ID {0} already started")]
    TaskExists(String),

    #[error("cannot destroy running task: {0}")]
    TaskRunning(String),
}

impl SandboxError {
    /// Wrap an error from one launch step.
    pub fn launch(step: &str, err: impl std::fmt::Display) -> Self {
        SandboxError::Launch(format!("{step}: {err}"))
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type alias for taskbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_path() {
        let path = exit_status_path(Path::new("/alloc/web"));
        assert_eq!(path, PathBuf::from("/alloc/web/local/.exit_status.txt"));
    }

    #[test]
    fn test_signaled_uses_shell_convention() {
        let result = ExitResult::signaled(libc::SIGTERM);
        assert_eq!(result.exit_code, 143);
        assert_eq!(result.signal, libc::SIGTERM);
        assert!(result.err.is_none());
        assert!(!result.successful());
    }

    #[test]
    fn test_failed_carries_unknown_code() {
        let result = ExitResult::failed("pidfd_open: No such process");
        assert_eq!(result.exit_code, EXIT_CODE_UNKNOWN);
        assert_eq!(result.err.as_deref(), Some("pidfd_open: No such process"));
    }

    #[test]
    fn test_launch_error_message() {
        let err = SandboxError::launch("failed to lookup user", "no such user: ghost");
        assert_eq!(
            err.to_string(),
            "Launch error: failed to lookup user: no such user: ghost"
        );
    }
}
