//! Sandbox entrypoint, run as `<self> sandbox-entry` inside the namespaces.
//!
//! Argument layout after the subcommand:
//!
//! ```text
//! <true|false>     include default unveil paths
//! <stdout path>    named pipe for standard output
//! <stderr path>    named pipe for standard error
//! [mode:path ...]  additional unveil rules
//! --               sentinel
//! <command> [args]
//! ```
//!
//! No logger is configured here: stdout and stderr belong to the task.

use crate::config::types::{exit_status_path, Result as SandboxResult};
use crate::core::types::{
    EXIT_BAD_LOGGING, EXIT_FAILURE, EXIT_NOT_RUNNABLE, EXIT_WRONG_ARGS, TASK_DIR_ENV,
};
use crate::kernel::signal::absorb_signals;
use crate::kernel::unveil::lockdown;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Parsed entrypoint arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShimArgs {
    pub unveil_defaults: bool,
    pub out_pipe: PathBuf,
    pub err_pipe: PathBuf,
    pub unveil_paths: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
}

impl ShimArgs {
    pub fn parse(args: &[String]) -> Option<Self> {
        if args.len() < 3 {
            return None;
        }
        let rest = &args[3..];
        let sentinel = rest.iter().position(|a| a == "--")?;
        let (command, cmd_args) = rest[sentinel + 1..].split_first()?;

        Some(Self {
            unveil_defaults: args[0] == "true",
            out_pipe: PathBuf::from(&args[1]),
            err_pipe: PathBuf::from(&args[2]),
            unveil_paths: rest[..sentinel].to_vec(),
            command: command.clone(),
            args: cmd_args.to_vec(),
        })
    }
}

fn task_dir() -> PathBuf {
    std::env::var_os(TASK_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Exit code of a finished child, 128 + signal when it was killed.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => EXIT_FAILURE,
    }
}

/// Run the entrypoint and return the process exit status.
pub fn run(args: &[String]) -> i32 {
    // stay alive through group-wide stop signals to capture the exit code
    let absorbed = absorb_signals();

    let Some(shim) = ShimArgs::parse(args) else {
        eprintln!(
            "sandbox entrypoint invoked with insufficient arguments: {}",
            args.len()
        );
        return EXIT_WRONG_ARGS;
    };

    let open_pipe = |path: &PathBuf| OpenOptions::new().write(true).open(path);
    let (stdout, mut stderr) = match (open_pipe(&shim.out_pipe), open_pipe(&shim.err_pipe)) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("failed to open output pipes: {}", e);
            return EXIT_BAD_LOGGING;
        }
    };
    report_unabsorbed(absorbed, &mut stderr);

    let task_dir = task_dir();
    let mut rules = shim.unveil_paths.clone();
    rules.push(format!("w:{}", shim.out_pipe.display()));
    rules.push(format!("w:{}", shim.err_pipe.display()));
    rules.push(format!("rwc:{}", task_dir.join("local").display()));

    if let Err(e) = lockdown(shim.unveil_defaults, &rules) {
        let _ = writeln!(stderr, "unable to lockdown: {}", e);
        return EXIT_FAILURE;
    }

    let code = match run_command(&shim, &stdout, &stderr) {
        Ok(code) => code,
        Err(message) => {
            let _ = writeln!(stderr, "{}", message);
            EXIT_NOT_RUNNABLE
        }
    };

    drop(stdout);
    drop(stderr);

    let _ = record_exit_status(&task_dir, code);
    code
}

/// A stop signal may now end the entrypoint before the exit code is recorded.
fn report_unabsorbed(absorbed: SandboxResult<()>, stderr: &mut impl Write) {
    if let Err(e) = absorbed {
        let _ = writeln!(stderr, "unable to absorb signals: {}", e);
    }
}

/// Publish `code` as the task's recovery file.
///
/// The digits go to a temporary file that is renamed into place, so a reader
/// never observes a created but still empty file.
pub fn record_exit_status(task_dir: &Path, code: i32) -> std::io::Result<()> {
    let path = exit_status_path(task_dir);
    let mut staging = path.clone().into_os_string();
    staging.push(".tmp");
    std::fs::write(&staging, code.to_string())?;
    std::fs::rename(&staging, &path)
}

fn run_command(shim: &ShimArgs, stdout: &File, stderr: &File) -> Result<i32, String> {
    let path = which::which(&shim.command)
        .map_err(|e| format!("failed to locate command {:?}: {}", shim.command, e))?;

    let pipe = |f: &File| {
        f.try_clone()
            .map(Stdio::from)
            .map_err(|e| format!("failed to duplicate output pipe: {}", e))
    };

    let status = Command::new(&path)
        .args(&shim.args)
        .stdout(pipe(stdout)?)
        .stderr(pipe(stderr)?)
        .status()
        .map_err(|e| format!("failed to run {}: {}", path.display(), e))?;

    Ok(exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_full() {
        let parsed = ShimArgs::parse(&argv(&[
            "true",
            "/logs/out.fifo",
            "/logs/err.fifo",
            "r:/etc/ssl",
            "rwc:/srv/data",
            "--",
            "sleep",
            "10",
        ]))
        .unwrap();
        assert!(parsed.unveil_defaults);
        assert_eq!(parsed.out_pipe, PathBuf::from("/logs/out.fifo"));
        assert_eq!(parsed.err_pipe, PathBuf::from("/logs/err.fifo"));
        assert_eq!(parsed.unveil_paths, argv(&["r:/etc/ssl", "rwc:/srv/data"]));
        assert_eq!(parsed.command, "sleep");
        assert_eq!(parsed.args, argv(&["10"]));
    }

    #[test]
    fn test_parse_without_rules() {
        let parsed = ShimArgs::parse(&argv(&["false", "/o", "/e", "--", "true"])).unwrap();
        assert!(!parsed.unveil_defaults);
        assert!(parsed.unveil_paths.is_empty());
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn test_parse_rejects_short_or_commandless() {
        assert!(ShimArgs::parse(&argv(&["true", "/o"])).is_none());
        assert!(ShimArgs::parse(&argv(&["true", "/o", "/e", "r:/x"])).is_none());
        assert!(ShimArgs::parse(&argv(&["true", "/o", "/e", "--"])).is_none());
    }

    #[test]
    fn test_wrong_args_exit_status() {
        assert_eq!(run(&argv(&["true"])), EXIT_WRONG_ARGS);
    }

    #[test]
    fn test_bad_logging_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent").join("out.fifo");
        let args = vec![
            "true".to_string(),
            missing.display().to_string(),
            missing.display().to_string(),
            "--".to_string(),
            "true".to_string(),
        ];
        assert_eq!(run(&args), EXIT_BAD_LOGGING);
    }

    #[test]
    fn test_record_exit_status_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("local")).unwrap();
        record_exit_status(dir.path(), 3).unwrap();
        record_exit_status(dir.path(), 143).unwrap();

        let path = exit_status_path(dir.path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "143");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("local"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![path.file_name().unwrap().to_os_string()]);
    }

    #[test]
    fn test_record_exit_status_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(record_exit_status(dir.path(), 0).is_err());
    }

    #[test]
    fn test_unabsorbed_signals_reported() {
        let mut stderr = Vec::new();
        report_unabsorbed(Ok(()), &mut stderr);
        assert!(stderr.is_empty());

        let err = crate::config::types::SandboxError::Signal("sigaction: EINVAL".to_string());
        report_unabsorbed(Err(err), &mut stderr);
        let message = String::from_utf8(stderr).unwrap();
        assert!(message.starts_with("unable to absorb signals:"));
        assert!(message.contains("sigaction: EINVAL"));
    }

    #[test]
    fn test_exit_code_conventions() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), 143);
    }
}
