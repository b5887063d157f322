//! Exit waiting for a supervised process.
//!
//! A waiter blocks on a kernel primitive in its own thread and delivers one
//! `ExitResult` on a single-use channel. The sender is dropped right after
//! the send, so any later receive observes a disconnected channel.

use crate::config::types::{exit_status_path, ExitResult, Result, SandboxError};
use crate::kernel::pidfd::{pidfd_open, wait_readable};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::thread;

/// How the terminal state of a process is observed.
#[derive(Clone, Debug)]
pub enum ExitWaiter {
    /// The process is our own child; reap it with `waitpid`.
    Child { pid: Pid },
    /// Known only by PID after a supervisor restart; poll a pidfd, then read
    /// the recovery file the sandbox entrypoint wrote into the task directory.
    Orphan { pid: i32, task_dir: PathBuf },
}

impl ExitWaiter {
    /// Start waiting in the background and return the result channel.
    pub fn wait(self) -> Receiver<ExitResult> {
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let result = self.block();
            debug!(
                "Process exited: code={} signal={} err={:?}",
                result.exit_code, result.signal, result.err
            );
            let _ = tx.send(result);
        });
        rx
    }

    fn block(&self) -> ExitResult {
        match self {
            ExitWaiter::Child { pid } => wait_child(*pid),
            ExitWaiter::Orphan { pid, task_dir } => wait_orphan(*pid, task_dir),
        }
    }
}

fn wait_child(pid: Pid) -> ExitResult {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitResult::exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return ExitResult::signaled(sig as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return ExitResult::failed(format!("waitpid({}): {}", pid, e)),
        }
    }
}

fn wait_orphan(pid: i32, task_dir: &Path) -> ExitResult {
    // the pidfd pins this process instance; a reused PID cannot match it
    let fd = match pidfd_open(pid) {
        Ok(fd) => fd,
        Err(e) => {
            warn!("Unable to reattach to pid {}: {}", pid, e);
            return ExitResult::failed(format!("failed to open pidfd for {}: {}", pid, e));
        }
    };

    // an unreadable or partial file means the entrypoint has not finished yet
    let status_file = exit_status_path(task_dir);
    if let Ok(code) = read_exit_status(&status_file) {
        return ExitResult::exited(code);
    }

    wait_readable(&fd);
    recovered_result(&status_file)
}

fn recovered_result(path: &Path) -> ExitResult {
    match read_exit_status(path) {
        Ok(code) => ExitResult::exited(code),
        Err(e) => ExitResult::failed(e.to_string()),
    }
}

/// Parse the decimal exit code stored in a recovery file.
pub fn read_exit_status(path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SandboxError::Recovery(format!("failed to read {}: {}", path.display(), e))
    })?;
    content.trim().parse::<i32>().map_err(|e| {
        SandboxError::Recovery(format!(
            "failed to parse exit code {:?} from {}: {}",
            content,
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EXIT_CODE_UNKNOWN;
    use std::process::Command;
    use std::time::Duration;

    fn task_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("local")).unwrap();
        dir
    }

    #[test]
    fn test_child_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let rx = ExitWaiter::Child { pid }.wait();
        assert_eq!(rx.recv().unwrap(), ExitResult::exited(3));
        // single delivery: the channel is closed afterwards
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_child_signaled() {
        let child = Command::new("sleep").arg("10").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let rx = ExitWaiter::Child { pid }.wait();
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.exit_code, 137);
        assert_eq!(result.signal, libc::SIGKILL);
        assert!(result.err.is_none());
    }

    #[test]
    fn test_orphan_dead_pid_is_unknown() {
        let dir = task_dir();
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let rx = ExitWaiter::Orphan {
            pid,
            task_dir: dir.path().to_path_buf(),
        }
        .wait();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.exit_code, EXIT_CODE_UNKNOWN);
        assert!(result.err.is_some());
    }

    #[test]
    fn test_orphan_corrupt_status_file() {
        let dir = task_dir();
        std::fs::write(exit_status_path(dir.path()), "garbage").unwrap();
        let mut child = Command::new("sleep").arg("0.1").spawn().unwrap();
        let rx = ExitWaiter::Orphan {
            pid: child.id() as i32,
            task_dir: dir.path().to_path_buf(),
        }
        .wait();

        // still garbage after the process is gone
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.exit_code, EXIT_CODE_UNKNOWN);
        assert!(result.err.unwrap().contains("failed to parse exit code"));
        let _ = child.wait();
    }

    #[test]
    fn test_read_exit_status() {
        let dir = task_dir();
        let path = exit_status_path(dir.path());
        assert!(read_exit_status(&path).is_err());
        std::fs::write(&path, "143").unwrap();
        assert_eq!(read_exit_status(&path).unwrap(), 143);
    }
}
