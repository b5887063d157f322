//! Orchestrator-facing task operations.
//!
//! The driver owns the task registry and the host CPU specification, turns
//! task configurations into supervised sandboxes and exposes start, recover,
//! wait, stop, signal, destroy, inspect and stats operations by task ID.

use crate::config::driver::{DriverConfig, TaskConfig};
use crate::config::types::{ExitResult, Result, SandboxError};
use crate::core::Supervisor;
use crate::kernel::cgroup::backend::{cgroup_v2_available, CgroupBackend};
use crate::kernel::cgroup::CgroupV2;
use crate::resources::{CpuSpecs, Utilization};
use crate::task::{Handle, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Signal used by `stop_task` when none is given.
pub const DEFAULT_STOP_SIGNAL: &str = "sigint";

/// Signal and grace period used when force-destroying a running task.
pub const DESTROY_SIGNAL: &str = "sigabrt";
pub const DESTROY_TIMEOUT: Duration = Duration::from_millis(100);

/// State persisted by the orchestrator at start and handed back on recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub pid: i32,
    pub task_config: TaskConfig,
    pub started_at: DateTime<Utc>,
}

impl RecoveryState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SandboxError::Recovery(format!("failed to encode task state: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SandboxError::Recovery(format!("failed to decode task state: {}", e)))
    }
}

/// One periodic stats sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    pub usage: Utilization,
    pub timestamp: DateTime<Utc>,
}

/// Host readiness as reported by `preflight`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Undetected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub state: HealthState,
    pub description: String,
}

impl Health {
    fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            description: "ready".to_string(),
        }
    }

    fn undetected(description: impl Into<String>) -> Self {
        Self {
            state: HealthState::Undetected,
            description: description.into(),
        }
    }
}

/// Check that the host can run sandboxed tasks.
///
/// `find` resolves a tool name to a path; injected so the check is testable.
pub fn preflight_with<F>(is_root: bool, find: F) -> Health
where
    F: Fn(&str) -> bool,
{
    if !is_root {
        return Health::undetected("driver must run as root");
    }
    for tool in ["nsenter", "unshare"] {
        if !find(tool) {
            return Health::undetected(format!("{} executable not found", tool));
        }
    }
    Health::healthy()
}

pub fn preflight() -> Health {
    let health = preflight_with(nix::unistd::geteuid().is_root(), |tool| {
        which::which(tool).is_ok()
    });
    if health.state == HealthState::Healthy && !cgroup_v2_available() {
        return Health::undetected("cgroup v2 hierarchy not mounted");
    }
    health
}

/// Task driver.
pub struct Driver {
    config: DriverConfig,
    specs: Arc<CpuSpecs>,
    tasks: TaskStore,
    // dropping the sender disconnects every background worker
    shutdown: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Driver {
    /// Create a driver, resolving the host CPU specification once.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let specs = config.cpu_specs()?;
        info!(
            "Host compute: {} MHz over {} cores",
            specs.total_mhz(),
            specs.cores()
        );
        Ok(Self::with_specs(config, Arc::new(specs)))
    }

    pub fn with_specs(config: DriverConfig, specs: Arc<CpuSpecs>) -> Self {
        let (tx, rx) = bounded(0);
        Self {
            config,
            specs,
            tasks: TaskStore::new(),
            shutdown: Mutex::new(Some(tx)),
            shutdown_rx: rx,
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    fn handle(&self, id: &str) -> Result<Arc<Handle>> {
        self.tasks
            .get(id)
            .ok_or_else(|| SandboxError::TaskNotFound(id.to_string()))
    }

    fn backend(task: &TaskConfig) -> Arc<dyn CgroupBackend> {
        Arc::new(CgroupV2::new(&task.cgroup))
    }

    /// Launch a task and return the state to persist for recovery.
    pub fn start_task(&self, task: TaskConfig) -> Result<RecoveryState> {
        if task.user.is_empty() {
            return Err(SandboxError::Config("user must be set".to_string()));
        }
        let Some(reservation) = self.tasks.reserve(&task.id) else {
            return Err(SandboxError::TaskExists(task.id.clone()));
        };

        info!("Starting task {} ({})", task.id, task.name);

        let rules = self.config.unveil_rules(&task)?;
        let bandwidth = self.specs.bandwidth(task.cpu_mhz);
        let env = task.environment(bandwidth);
        let spec = task.sandbox_spec(rules, self.config.unveil_defaults);

        let mut supervisor = Supervisor::new(env, spec, self.specs.clone(), Self::backend(&task))
            .with_entrypoint(self.config.entrypoint.clone());
        supervisor.start()?;

        let started_at = Utc::now();
        let state = RecoveryState {
            pid: supervisor.pid(),
            task_config: task.clone(),
            started_at,
        };
        let handle = Handle::new(&task.id, &task.name, supervisor, started_at)?;
        reservation.commit(Arc::new(handle));
        Ok(state)
    }

    /// Re-attach to a task started by a previous driver process.
    pub fn recover_task(&self, state: &RecoveryState) -> Result<()> {
        let task = &state.task_config;
        let Some(reservation) = self.tasks.reserve(&task.id) else {
            debug!("Task {} already known, nothing to recover", task.id);
            return Ok(());
        };

        info!("Recovering task {} at pid {}", task.id, state.pid);
        let env = task.environment(self.specs.bandwidth(task.cpu_mhz));
        let supervisor =
            Supervisor::recover(state.pid, env, self.specs.clone(), Self::backend(task));
        let handle = Handle::new(&task.id, &task.name, supervisor, state.started_at)?;
        reservation.commit(Arc::new(handle));
        Ok(())
    }

    /// Channel delivering the task's exit result exactly once.
    pub fn wait_task(&self, id: &str) -> Result<Receiver<ExitResult>> {
        let handle = self.handle(id)?;
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = tx.send(handle.block());
        });
        Ok(rx)
    }

    /// Stop a task gracefully; unknown tasks are ignored.
    pub fn stop_task(&self, id: &str, timeout: Duration, signal: &str) -> Result<()> {
        let signal = if signal.is_empty() {
            DEFAULT_STOP_SIGNAL
        } else {
            signal
        };
        debug!("Stopping task {} with {} (timeout {:?})", id, signal, timeout);
        match self.tasks.get(id) {
            Some(handle) => handle.stop(signal, timeout),
            None => Ok(()),
        }
    }

    /// Deliver a signal to a task; unknown tasks are ignored.
    pub fn signal_task(&self, id: &str, signal: &str) -> Result<()> {
        if signal.is_empty() {
            return Err(SandboxError::Signal("signal must be set".to_string()));
        }
        match self.tasks.get(id) {
            Some(handle) => handle.signal(signal),
            None => Ok(()),
        }
    }

    /// Remove a task. A running task is only removed when `force` is set,
    /// after being stopped with `sigabrt`.
    pub fn destroy_task(&self, id: &str, force: bool) -> Result<()> {
        let Some(handle) = self.tasks.get(id) else {
            return Ok(());
        };

        let mut result = Ok(());
        if handle.is_running() {
            if !force {
                return handle.ensure_stopped();
            }
            result = handle.stop(DESTROY_SIGNAL, DESTROY_TIMEOUT);
        }

        self.tasks.del(id);
        info!("Destroyed task {}", id);
        result
    }

    pub fn inspect_task(&self, id: &str) -> Result<TaskStatus> {
        Ok(self.handle(id)?.status())
    }

    /// Periodic utilization samples for a task.
    ///
    /// The worker sleeps `interval` after each sample, so a slow cgroup read
    /// delays the next sample instead of overlapping it. It ends when the
    /// receiver is dropped or the driver shuts down.
    pub fn task_stats(&self, id: &str, interval: Duration) -> Result<Receiver<TaskResourceUsage>> {
        let handle = self.handle(id)?;
        let shutdown = self.shutdown_rx.clone();
        let (tx, rx) = bounded(1);

        thread::spawn(move || {
            let mut wait = Duration::ZERO;
            loop {
                match shutdown.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let sample = TaskResourceUsage {
                    usage: handle.stats(),
                    timestamp: Utc::now(),
                };
                if tx.send(sample).is_err() {
                    break;
                }
                wait = interval;
            }
            debug!("Stats worker for task {} exiting", handle.id());
        });

        Ok(rx)
    }

    /// Stop all background workers. Task exit results are unaffected.
    pub fn shutdown(&self) {
        if self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            warn!("Driver shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> Driver {
        Driver::with_specs(
            DriverConfig::default(),
            Arc::new(CpuSpecs::from_compute(4000, 2).unwrap()),
        )
    }

    #[test]
    fn test_start_requires_user() {
        let err = driver().start_task(TaskConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: user must be set");
    }

    #[test]
    fn test_unknown_task_operations() {
        let driver = driver();
        assert!(matches!(
            driver.inspect_task("missing"),
            Err(SandboxError::TaskNotFound(_))
        ));
        assert!(matches!(
            driver.wait_task("missing"),
            Err(SandboxError::TaskNotFound(_))
        ));
        assert!(driver.task_stats("missing", Duration::from_secs(1)).is_err());
        assert!(driver
            .stop_task("missing", Duration::from_secs(1), "")
            .is_ok());
        assert!(driver.signal_task("missing", "sigterm").is_ok());
        assert!(driver.destroy_task("missing", false).is_ok());
    }

    #[test]
    fn test_signal_must_be_set() {
        let err = driver().signal_task("anything", "").unwrap_err();
        assert!(err.to_string().contains("signal must be set"));
    }

    #[test]
    fn test_recovery_state_roundtrip() {
        let state = RecoveryState {
            pid: 4242,
            task_config: TaskConfig {
                id: "t1".to_string(),
                user: "nobody".to_string(),
                command: "sleep".to_string(),
                ..TaskConfig::default()
            },
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let decoded = RecoveryState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(RecoveryState::decode(b"{not json").is_err());
    }

    #[test]
    fn test_preflight_checks() {
        assert_eq!(
            preflight_with(false, |_| true).state,
            HealthState::Undetected
        );
        let missing = preflight_with(true, |tool| tool != "unshare");
        assert_eq!(missing.state, HealthState::Undetected);
        assert_eq!(missing.description, "unshare executable not found");
        assert_eq!(preflight_with(true, |_| true), Health::healthy());
    }
}
