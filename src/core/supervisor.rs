use crate::config::types::{
    exit_status_path, Environment, ExitResult, Result, SandboxError, SandboxSpec,
};
use crate::core::command::{NamespaceTools, SandboxCommand};
use crate::core::waiter::ExitWaiter;
use crate::kernel::cgroup::backend::CgroupBackend;
use crate::kernel::credentials::{chown_pipes, lookup_user};
use crate::kernel::signal::ProcessGroup;
use crate::kernel::spawn::spawn_in_cgroup;
use crate::resources::{CpuSpecs, CpuTracker, Utilization};
use crossbeam_channel::{after, select, tick, Receiver};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Cadence at which `stop` checks whether the cgroup has drained.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Supervises one sandboxed process tree.
///
/// Created either fresh (then `start`ed) or by recovery from a persisted PID.
/// All operations other than `start` require a running or recovered process.
pub struct Supervisor {
    env: Environment,
    spec: Option<SandboxSpec>,
    specs: Arc<CpuSpecs>,
    cgroup: Arc<dyn CgroupBackend>,
    entrypoint: Option<PathBuf>,
    pid: i32,
    waiter: Option<Receiver<ExitResult>>,
    cpu: Mutex<CpuTracker>,
}

impl Supervisor {
    pub fn new(
        env: Environment,
        spec: SandboxSpec,
        specs: Arc<CpuSpecs>,
        cgroup: Arc<dyn CgroupBackend>,
    ) -> Self {
        Self {
            env,
            spec: Some(spec),
            specs,
            cgroup,
            entrypoint: None,
            pid: 0,
            waiter: None,
            cpu: Mutex::new(CpuTracker::new()),
        }
    }

    /// Re-attach to a process that was started by a previous supervisor.
    pub fn recover(
        pid: i32,
        env: Environment,
        specs: Arc<CpuSpecs>,
        cgroup: Arc<dyn CgroupBackend>,
    ) -> Self {
        let waiter = ExitWaiter::Orphan {
            pid,
            task_dir: env.task_dir.clone(),
        }
        .wait();
        info!("Recovered supervision of pid {}", pid);
        Self {
            env,
            spec: None,
            specs,
            cgroup,
            entrypoint: None,
            pid,
            waiter: Some(waiter),
            cpu: Mutex::new(CpuTracker::new()),
        }
    }

    /// Use `path` instead of the running executable as the sandbox entrypoint.
    pub fn with_entrypoint(mut self, path: Option<PathBuf>) -> Self {
        self.entrypoint = path;
        self
    }

    /// Launch the sandbox. The cgroup descriptor is released on every path.
    pub fn start(&mut self) -> Result<()> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| SandboxError::Launch("a recovered task cannot be started".to_string()))?;
        if self.waiter.is_some() {
            return Err(SandboxError::Launch("task already started".to_string()));
        }

        let user = lookup_user(&self.env.user)
            .map_err(|e| SandboxError::launch("failed to lookup user", e))?;

        // a leftover code from an earlier run would be reported for this one
        clear_exit_status(&self.env.task_dir)
            .map_err(|e| SandboxError::launch("failed to clear previous exit status", e))?;

        let cgroup_fd = self
            .cgroup
            .open_descriptor()
            .map_err(|e| SandboxError::launch("failed to open cgroup for descriptor", e))?;

        self.constrain()
            .map_err(|e| SandboxError::launch("failed to write cgroup constraints", e))?;

        chown_pipes(&self.env.out_pipe, &self.env.err_pipe, user.uid, user.gid)
            .map_err(|e| SandboxError::launch("failed to set logging pipe ownership", e))?;

        let tools =
            NamespaceTools::locate().map_err(|e| SandboxError::launch("failed to start command", e))?;
        let shim = match &self.entrypoint {
            Some(path) => path.clone(),
            None => std::env::current_exe()
                .map_err(|e| SandboxError::launch("failed to start command", e))?,
        };
        let command = SandboxCommand::build(&self.env, spec, &tools, &shim, &user);
        debug!("Sandbox command: {:?}", command.argv);

        let pid = spawn_in_cgroup(
            &command.program,
            &command.argv,
            &command.env,
            &self.env.task_dir,
            &cgroup_fd,
            self.env.oom_score_adj,
        )
        .map_err(|e| SandboxError::launch("failed to start command", e))?;

        self.pid = pid.as_raw();
        self.waiter = Some(ExitWaiter::Child { pid }.wait());
        info!(
            "Started {} as pid {} in {}",
            spec.command,
            pid,
            self.cgroup.path().display()
        );
        Ok(())
    }

    fn constrain(&self) -> Result<()> {
        self.cgroup.set_cpu_bandwidth(self.env.cpu_bandwidth)?;
        self.cgroup
            .set_memory_limits(self.env.memory, self.env.memory_max)
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Single-use channel yielding the one `ExitResult` of this process.
    pub fn wait_channel(&self) -> Result<Receiver<ExitResult>> {
        self.waiter
            .clone()
            .ok_or_else(|| SandboxError::Process("task has not been started".to_string()))
    }

    /// Send a named signal to the whole process group.
    pub fn signal(&self, name: &str) -> Result<()> {
        debug!("Sending {} to process group {}", name, self.pid);
        ProcessGroup::new(self.pid).send(name)
    }

    /// Signal the group, then escalate to `cgroup.kill` if it has not
    /// drained within `timeout`. Returns the result of the initial signal.
    pub fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let result = self.signal(name);
        if self.await_drained(timeout) {
            if let Err(e) = self.cgroup.kill_all() {
                warn!("Force kill of {} failed: {}", self.cgroup.path().display(), e);
            }
        }
        result
    }

    /// Returns true when a force kill is required.
    fn await_drained(&self, timeout: Duration) -> bool {
        let ticker = tick(STOP_POLL_INTERVAL);
        let deadline = after(timeout);
        loop {
            select! {
                recv(ticker) -> _ => match self.cgroup.process_count() {
                    Ok(0) => return false,
                    Ok(n) => debug!("{} processes still running in pid {} group", n, self.pid),
                    Err(e) => {
                        warn!("Unable to count live processes: {}", e);
                        return true;
                    }
                },
                recv(deadline) -> _ => {
                    warn!("Stop timeout of {:?} exceeded for pid {}", timeout, self.pid);
                    return true;
                }
            }
        }
    }

    /// Current memory and CPU utilization of the task cgroup.
    ///
    /// Unreadable cgroup files count as zero.
    pub fn stats(&self) -> Utilization {
        let memory = self.cgroup.memory_usage().unwrap_or_else(|e| {
            debug!("Memory usage unavailable: {}", e);
            Default::default()
        });
        let cpu = self.cgroup.cpu_usage().unwrap_or_else(|e| {
            debug!("CPU usage unavailable: {}", e);
            Default::default()
        });

        let percent = self
            .cpu
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .percent(cpu.user_usec, cpu.system_usec, cpu.usage_usec);

        Utilization {
            memory: memory.current,
            swap: memory.swap,
            cache: memory.cache,
            user: percent.user,
            system: percent.system,
            percent: percent.total,
            ticks: self.specs.ticks(percent.total),
        }
    }
}

fn clear_exit_status(task_dir: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(exit_status_path(task_dir)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::cgroup::CgroupV2;

    fn fake_cgroup() -> (tempfile::TempDir, Arc<dyn CgroupBackend>) {
        let dir = tempfile::tempdir().unwrap();
        for file in ["cpu.max", "memory.max", "memory.low", "cgroup.kill"] {
            std::fs::write(dir.path().join(file), "").unwrap();
        }
        let backend: Arc<dyn CgroupBackend> = Arc::new(CgroupV2::new(dir.path()));
        (dir, backend)
    }

    fn environment(cgroup: &std::path::Path) -> Environment {
        Environment {
            user: "root".to_string(),
            cgroup: cgroup.to_path_buf(),
            memory: 64 * 1024 * 1024,
            cpu_bandwidth: 50_000,
            ..Environment::default()
        }
    }

    fn specs() -> Arc<CpuSpecs> {
        Arc::new(CpuSpecs::from_compute(8000, 4).unwrap())
    }

    #[test]
    fn test_start_rejects_unknown_user() {
        let (dir, cgroup) = fake_cgroup();
        let mut env = environment(dir.path());
        env.user = "taskbox-no-such-user".to_string();
        let mut supervisor = Supervisor::new(env, SandboxSpec::default(), specs(), cgroup);
        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("failed to lookup user"));
        assert!(supervisor.wait_channel().is_err());
    }

    #[test]
    fn test_start_rejects_missing_cgroup() {
        let env = environment(std::path::Path::new("/nonexistent/taskbox.scope"));
        let cgroup: Arc<dyn CgroupBackend> = Arc::new(CgroupV2::new(&env.cgroup));
        let mut supervisor = Supervisor::new(env, SandboxSpec::default(), specs(), cgroup);
        let err = supervisor.start().unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to open cgroup for descriptor"));
    }

    #[test]
    fn test_start_clears_previous_exit_status() {
        let task = tempfile::tempdir().unwrap();
        std::fs::create_dir(task.path().join("local")).unwrap();
        std::fs::write(exit_status_path(task.path()), "3").unwrap();

        let mut env = environment(std::path::Path::new("/nonexistent/taskbox.scope"));
        env.task_dir = task.path().to_path_buf();
        let cgroup: Arc<dyn CgroupBackend> = Arc::new(CgroupV2::new(&env.cgroup));
        let mut supervisor = Supervisor::new(env, SandboxSpec::default(), specs(), cgroup);

        // the launch fails later, but the stale code is already gone
        assert!(supervisor.start().is_err());
        assert!(!exit_status_path(task.path()).exists());

        // nothing to clear is fine
        assert!(clear_exit_status(task.path()).is_ok());
    }

    #[test]
    fn test_clear_exit_status_reports_other_errors() {
        let task = tempfile::tempdir().unwrap();
        // a directory in place of the file cannot be removed with remove_file
        std::fs::create_dir_all(exit_status_path(task.path())).unwrap();
        assert!(clear_exit_status(task.path()).is_err());
    }

    #[test]
    fn test_start_fails_on_pipe_ownership() {
        let (dir, cgroup) = fake_cgroup();
        let mut env = environment(dir.path());
        env.out_pipe = dir.path().join("missing.stdout");
        env.err_pipe = dir.path().join("missing.stderr");
        let mut supervisor = Supervisor::new(env, SandboxSpec::default(), specs(), cgroup);
        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("failed to set logging pipe ownership"));

        // constraints were written before the ownership step
        let cpu_max = std::fs::read_to_string(dir.path().join("cpu.max")).unwrap();
        assert_eq!(cpu_max, "50000 100000");
    }

    #[test]
    fn test_recovered_cannot_start() {
        let (dir, cgroup) = fake_cgroup();
        let mut supervisor = Supervisor::recover(
            std::process::id() as i32,
            environment(dir.path()),
            specs(),
            cgroup,
        );
        assert!(supervisor.start().is_err());
        assert_eq!(supervisor.pid(), std::process::id() as i32);
    }

    #[test]
    fn test_stats_first_sample_is_zero_cpu() {
        let (dir, cgroup) = fake_cgroup();
        std::fs::write(dir.path().join("memory.current"), "1048576").unwrap();
        std::fs::write(
            dir.path().join("cpu.stat"),
            "usage_usec 5000000\nuser_usec 4000000\nsystem_usec 1000000\n",
        )
        .unwrap();
        let supervisor = Supervisor::new(
            environment(dir.path()),
            SandboxSpec::default(),
            specs(),
            cgroup,
        );
        let stats = supervisor.stats();
        assert_eq!(stats.memory, 1_048_576);
        assert_eq!(stats.percent, 0.0);
        assert_eq!(stats.ticks, 0.0);
    }
}
