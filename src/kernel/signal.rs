use crate::config::types::{Result, SandboxError};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
/// Signal naming, process-group delivery and async-safe signal handling
///
/// Handlers here only touch atomics; everything else happens on the main loop.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Translate a symbolic signal name (`sigterm`, `TERM`, ...) to a signal.
///
/// Unrecognized names yield `None`, which is delivered as signal 0: the
/// kernel checks that the target exists but nothing is sent.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let lower = name.trim().to_ascii_lowercase();
    let short = lower.strip_prefix("sig").unwrap_or(&lower);
    match short {
        "hup" => Some(Signal::SIGHUP),
        "int" => Some(Signal::SIGINT),
        "quit" => Some(Signal::SIGQUIT),
        "trap" => Some(Signal::SIGTRAP),
        "abrt" => Some(Signal::SIGABRT),
        "kill" => Some(Signal::SIGKILL),
        "usr1" => Some(Signal::SIGUSR1),
        "usr2" => Some(Signal::SIGUSR2),
        "alrm" => Some(Signal::SIGALRM),
        "term" => Some(Signal::SIGTERM),
        "stop" => Some(Signal::SIGSTOP),
        "pwr" => Some(Signal::SIGPWR),
        _ => None,
    }
}

/// Delivers named signals to the process group led by one PID.
#[derive(Clone, Copy, Debug)]
pub struct ProcessGroup {
    pid: i32,
}

impl ProcessGroup {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn send(&self, name: &str) -> Result<()> {
        if self.pid <= 1 {
            return Err(SandboxError::Signal(format!(
                "not a valid PID to signal: {}",
                self.pid
            )));
        }
        let sig = parse_signal(name);
        // negative pid addresses the whole group
        signal::kill(Pid::from_raw(-self.pid), sig).map_err(|e| {
            SandboxError::Signal(format!(
                "failed to send {} to process group {}: {}",
                name, self.pid, e
            ))
        })
    }
}

extern "C" fn absorb_handler(_signal: libc::c_int) {}

/// Keep the current process alive through group-wide signals.
///
/// Installs a no-op handler (not `SIG_IGN`, so exec'd children get default
/// dispositions back) for every catchable signal except synchronous faults.
pub fn absorb_signals() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(absorb_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in Signal::iterator() {
        match sig {
            Signal::SIGKILL
            | Signal::SIGSTOP
            | Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGILL
            | Signal::SIGSYS
            | Signal::SIGCHLD => continue,
            _ => {}
        }
        // SAFETY: the handler is an empty extern "C" fn, trivially async-signal-safe.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| SandboxError::Signal(format!("Failed to absorb {}: {}", sig, e)))?;
    }
    Ok(())
}

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self> {
        Self::install_signal_handlers()?;

        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<()> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: signal_handler only performs atomic stores.
            unsafe { signal::sigaction(sig, &sig_action) }.map_err(|e| {
                SandboxError::Signal(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Async-safe signal handler
    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}
