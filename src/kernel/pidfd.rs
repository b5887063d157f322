//! Process file descriptors (pidfd).
//!
//! A pidfd refers to one process instance, so waiting on it cannot race with
//! PID reuse. Requires Linux 5.3+.

use crate::config::types::{Result, SandboxError};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Open a pidfd for `pid`.
pub fn pidfd_open(pid: i32) -> Result<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and returns a new fd or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(SandboxError::Process(format!(
            "pidfd_open({}): {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: fd is a freshly returned descriptor we exclusively own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

/// Block until the process behind `fd` terminates.
///
/// Errors from poll are ignored: the only wake-ups that matter are the fd
/// becoming readable, and interrupted calls are simply retried.
pub fn wait_readable(fd: &OwnedFd) {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd points to one valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc > 0 {
            return;
        }
        if rc < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}
