use crate::config::driver::{DriverConfig, TaskConfig};
use crate::config::types::ExitResult;
use crate::core::{shim, LaunchMode};
use crate::driver::{preflight, Driver, HealthState, RecoveryState};
use crate::kernel::signal::SignalHandler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often the wait loop checks for a termination request.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a task and supervise it until it exits
    Run {
        /// Task configuration (JSON)
        #[arg(long)]
        task: PathBuf,
        /// Driver configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the recovery state (JSON) here once the task started
        #[arg(long)]
        state_out: Option<PathBuf>,
        /// Seconds to wait after the stop signal before force killing
        #[arg(long, default_value_t = 5)]
        stop_timeout: u64,
    },
    /// Re-attach to a task started by an earlier supervisor
    Recover {
        /// Recovery state (JSON) written by `run --state-out`
        #[arg(long)]
        state: PathBuf,
        /// Driver configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Seconds to wait after the stop signal before force killing
        #[arg(long, default_value_t = 5)]
        stop_timeout: u64,
    },
    /// Check whether this host can run sandboxed tasks
    Preflight,
}

/// Binary entrypoint: dispatch on launch mode, then run the CLI.
pub fn run() -> Result<()> {
    let args = match LaunchMode::from_args(std::env::args()) {
        // no logger inside the sandbox, stdio belongs to the task
        LaunchMode::SandboxEntry(args) => std::process::exit(shim::run(&args)),
        LaunchMode::Supervisor => Cli::parse(),
    };

    env_logger::init();

    match args.command {
        Commands::Run {
            task,
            config,
            state_out,
            stop_timeout,
        } => {
            let signals = SignalHandler::init()?;
            let driver = Driver::new(load_config(config.as_deref())?)?;
            let mut task = TaskConfig::load_from_file(&task)?;
            let id = task.ensure_id().to_string();

            let state = driver.start_task(task)?;
            info!("Task {} running as pid {}", id, state.pid);
            if let Some(path) = state_out {
                std::fs::write(&path, state.encode()?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }

            let result = supervise(&driver, &id, &signals, Duration::from_secs(stop_timeout))?;
            finish(&driver, result)
        }
        Commands::Recover {
            state,
            config,
            stop_timeout,
        } => {
            let signals = SignalHandler::init()?;
            let driver = Driver::new(load_config(config.as_deref())?)?;
            let data = std::fs::read(&state)
                .with_context(|| format!("failed to read {}", state.display()))?;
            let state = RecoveryState::decode(&data)?;
            let id = state.task_config.id.clone();

            driver.recover_task(&state)?;
            let result = supervise(&driver, &id, &signals, Duration::from_secs(stop_timeout))?;
            finish(&driver, result)
        }
        Commands::Preflight => {
            let health = preflight();
            println!("{}", serde_json::to_string_pretty(&health)?);
            if health.state != HealthState::Healthy {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
    Ok(match path {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::default(),
    })
}

/// Wait for the task, stopping it once if SIGINT/SIGTERM/SIGHUP arrives.
fn supervise(
    driver: &Driver,
    id: &str,
    signals: &SignalHandler,
    stop_timeout: Duration,
) -> Result<ExitResult> {
    let exit: Receiver<ExitResult> = driver.wait_task(id)?;
    let mut stopping = false;

    loop {
        match exit.recv_timeout(SIGNAL_POLL_INTERVAL) {
            Ok(result) => return Ok(result),
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("wait for task {} ended without a result", id)
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if signals.shutdown_requested() && !stopping {
            stopping = true;
            warn!(
                "Received signal {}, stopping task {}",
                signals.get_signal(),
                id
            );
            if let Err(e) = driver.stop_task(id, stop_timeout, "sigterm") {
                warn!("Stop of task {} reported: {}", id, e);
            }
        }
    }
}

fn finish(driver: &Driver, result: ExitResult) -> Result<()> {
    driver.shutdown();
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.successful() {
        let code = if (1..=255).contains(&result.exit_code) {
            result.exit_code
        } else {
            1
        };
        std::process::exit(code);
    }
    Ok(())
}
