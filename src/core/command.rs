//! Sandbox command line assembly.
//!
//! The launched process tree is
//! `[nsenter --net=<ns>] unshare ... <self> sandbox-entry <args> -- <command>`.

use crate::config::types::{Environment, Result, SandboxError, SandboxSpec};
use crate::core::types::{SHIM_SUBCOMMAND, TASK_DIR_ENV};
use crate::kernel::credentials::UserIdentity;
use std::path::{Path, PathBuf};

/// Variables never handed to a task.
const PURGED_VARIABLES: &[&str] = &["LS_COLORS", "XAUTHORITY", "DISPLAY", "COLORTERM", "MAIL"];

/// Absolute paths of the namespace tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceTools {
    pub nsenter: PathBuf,
    pub unshare: PathBuf,
}

impl NamespaceTools {
    /// Resolve `nsenter` and `unshare` through PATH.
    pub fn locate() -> Result<Self> {
        let find = |tool: &str| {
            which::which(tool)
                .map_err(|e| SandboxError::Process(format!("unable to locate {}: {}", tool, e)))
        };
        Ok(Self {
            nsenter: find("nsenter")?,
            unshare: find("unshare")?,
        })
    }
}

/// Fully resolved program, argument vector and environment for the launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

impl SandboxCommand {
    pub fn build(
        env: &Environment,
        spec: &SandboxSpec,
        tools: &NamespaceTools,
        shim: &Path,
        user: &UserIdentity,
    ) -> Self {
        let mut argv = Vec::new();

        if let Some(net) = &env.network_namespace {
            argv.extend([
                tools.nsenter.display().to_string(),
                "--no-fork".to_string(),
                format!("--net={}", net.display()),
                "--".to_string(),
            ]);
        }

        argv.extend([
            tools.unshare.display().to_string(),
            "--ipc".to_string(),
            "--pid".to_string(),
            "--mount-proc".to_string(),
            "--fork".to_string(),
            "--kill-child=SIGKILL".to_string(),
            format!("--setuid={}", user.uid),
            format!("--setgid={}", user.gid),
            "--".to_string(),
        ]);

        argv.push(shim.display().to_string());
        argv.push(SHIM_SUBCOMMAND.to_string());
        argv.push(spec.unveil_defaults.to_string());
        argv.push(env.out_pipe.display().to_string());
        argv.push(env.err_pipe.display().to_string());
        argv.extend(spec.unveil_paths.iter().cloned());
        argv.push("--".to_string());

        argv.push(spec.command.clone());
        argv.extend(spec.args.iter().cloned());

        Self {
            program: PathBuf::from(&argv[0]),
            argv,
            env: flatten_env(env, user),
        }
    }
}

/// Render the task environment as `KEY=VALUE` entries, sorted by key.
///
/// Sets `USER`, `HOME`, `TMPDIR` and the task directory variable; purges a
/// few desktop-session variables. Empty values are passed as a bare key.
pub fn flatten_env(env: &Environment, user: &UserIdentity) -> Vec<String> {
    let mut vars = env.env.clone();
    vars.insert("USER".to_string(), user.name.clone());
    vars.insert("HOME".to_string(), user.home.display().to_string());
    vars.insert(
        "TMPDIR".to_string(),
        env.task_dir.join("tmp").display().to_string(),
    );
    vars.insert(TASK_DIR_ENV.to_string(), env.task_dir.display().to_string());

    let mut result: Vec<String> = vars
        .into_iter()
        .filter(|(k, _)| !PURGED_VARIABLES.contains(&k.as_str()))
        .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
        .collect();
    result.sort();
    result
}
