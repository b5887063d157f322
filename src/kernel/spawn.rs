//! Process creation directly into a cgroup.
//!
//! `clone3(2)` with `CLONE_INTO_CGROUP` places the child in the task cgroup
//! atomically, so it never runs under the supervisor's cgroup. Between clone
//! and exec the child only makes async-signal-safe calls; everything it needs
//! is prepared by the parent beforehand.

use crate::config::types::{Result, SandboxError};
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{pipe2, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// `struct clone_args` as of Linux 5.7.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Everything the child needs, converted before the clone.
struct ExecImage {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    oom_score_adj: Option<CString>,
}

fn c_string(what: &str, value: &[u8]) -> Result<CString> {
    CString::new(value)
        .map_err(|_| SandboxError::Process(format!("{} contains an interior NUL byte", what)))
}

impl ExecImage {
    fn new(
        program: &Path,
        argv: &[String],
        envp: &[String],
        cwd: &Path,
        oom_score_adj: i32,
    ) -> Result<Self> {
        Ok(Self {
            program: c_string("program", program.as_os_str().as_bytes())?,
            argv: argv
                .iter()
                .map(|a| c_string("argument", a.as_bytes()))
                .collect::<Result<_>>()?,
            envp: envp
                .iter()
                .map(|e| c_string("environment", e.as_bytes()))
                .collect::<Result<_>>()?,
            cwd: c_string("working directory", cwd.as_os_str().as_bytes())?,
            oom_score_adj: match oom_score_adj {
                0 => None,
                n => Some(c_string("oom_score_adj", n.to_string().as_bytes())?),
            },
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Start `program` inside the cgroup referred to by `cgroup_fd`.
///
/// The child leads its own process group, runs in `cwd` with exactly `envp`
/// as environment and has its standard streams on `/dev/null`. Returns once
/// exec succeeded; an exec failure is reported as the OS error.
pub fn spawn_in_cgroup(
    program: &Path,
    argv: &[String],
    envp: &[String],
    cwd: &Path,
    cgroup_fd: &OwnedFd,
    oom_score_adj: i32,
) -> Result<Pid> {
    let image = ExecImage::new(program, argv, envp, cwd, oom_score_adj)?;
    let argv_ptrs = null_terminated(&image.argv);
    let envp_ptrs = null_terminated(&image.envp);

    let devnull = File::options()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| SandboxError::Process(format!("open /dev/null: {}", e)))?;

    let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SandboxError::Process(format!("pipe2: {}", e)))?;
    // SAFETY: both descriptors were just created by pipe2 and are owned here.
    let (mut err_read, err_write) =
        unsafe { (File::from_raw_fd(err_read), OwnedFd::from_raw_fd(err_write)) };

    let mut args = CloneArgs {
        flags: CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup_fd.as_raw_fd() as u64,
        ..CloneArgs::default()
    };

    // SAFETY: args is a valid clone_args of the size we pass. Without
    // CLONE_VM the child gets a private copy of the address space.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };

    if rc < 0 {
        return Err(SandboxError::Process(format!(
            "clone3: {}",
            std::io::Error::last_os_error()
        )));
    }

    if rc == 0 {
        // SAFETY: in the child only async-signal-safe libc calls are made on
        // memory prepared before the clone; the child never returns.
        unsafe {
            exec_child(
                &image,
                &argv_ptrs,
                &envp_ptrs,
                devnull.as_raw_fd(),
                err_write.as_raw_fd(),
            )
        }
    }

    let pid = Pid::from_raw(rc as i32);
    drop(err_write);

    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match err_read.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(SandboxError::Process(format!(
                    "reading exec status of {}: {}",
                    pid, e
                )))
            }
        }
    }

    if filled == 0 {
        log::debug!("Spawned {} into cgroup as pid {}", program.display(), pid);
        return Ok(pid);
    }

    // the child failed before exec and has already exited
    let _ = waitpid(pid, None);
    let errno = i32::from_ne_bytes(buf);
    Err(SandboxError::Process(format!(
        "exec {}: {}",
        program.display(),
        std::io::Error::from_raw_os_error(errno)
    )))
}

unsafe fn fail(err_fd: libc::c_int) -> ! {
    let errno = *libc::__errno_location();
    let bytes = errno.to_ne_bytes();
    libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(127)
}

unsafe fn exec_child(
    image: &ExecImage,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    devnull: libc::c_int,
    err_fd: libc::c_int,
) -> ! {
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(devnull, target) < 0 {
            fail(err_fd);
        }
    }

    if libc::setpgid(0, 0) < 0 {
        fail(err_fd);
    }

    if libc::chdir(image.cwd.as_ptr()) < 0 {
        fail(err_fd);
    }

    if let Some(score) = &image.oom_score_adj {
        // best effort, lowering the score needs CAP_SYS_RESOURCE
        let fd = libc::open(
            b"/proc/self/oom_score_adj\0".as_ptr().cast(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        );
        if fd >= 0 {
            let bytes = score.as_bytes();
            libc::write(fd, bytes.as_ptr().cast(), bytes.len());
            libc::close(fd);
        }
    }

    libc::execve(image.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    fail(err_fd)
}
