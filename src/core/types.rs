//! Launch-mode dispatch shared by the supervisor and the sandbox entrypoint
//!
//! The binary re-executes itself inside the new namespaces; the first
//! argument selects which half of the program runs.

/// First argument of a re-executed sandbox entrypoint.
pub const SHIM_SUBCOMMAND: &str = "sandbox-entry";

/// Environment variable carrying the task directory into the sandbox.
pub const TASK_DIR_ENV: &str = "TASKBOX_TASK_DIR";

/// Entrypoint exit status: the argument vector was malformed.
/// Logging is not configured yet, so the status itself is the diagnostic.
pub const EXIT_WRONG_ARGS: i32 = 40;

/// Entrypoint exit status: the output pipes could not be opened.
pub const EXIT_BAD_LOGGING: i32 = 41;

/// Entrypoint exit status: filesystem lockdown failed.
pub const EXIT_FAILURE: i32 = 1;

/// Entrypoint exit status: the task command could not be resolved or run.
pub const EXIT_NOT_RUNNABLE: i32 = 127;

/// How this process was invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Regular CLI / supervisor invocation
    Supervisor,
    /// Re-executed inside the sandbox; carries the arguments after the subcommand
    SandboxEntry(Vec<String>),
}

impl LaunchMode {
    /// Select the launch mode from a full argument vector (including argv[0]).
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter().skip(1);
        match args.next() {
            Some(first) if first == SHIM_SUBCOMMAND => LaunchMode::SandboxEntry(args.collect()),
            _ => LaunchMode::Supervisor,
        }
    }
}
