use crate::config::types::{ExitResult, Result, SandboxError, TaskState};
use crate::core::Supervisor;
use crate::resources::Utilization;
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// How long a utilization snapshot is served before cgroup files are read again.
pub const STATS_TTL: Duration = Duration::from_secs(10);

/// Read-only view of one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_result: Option<ExitResult>,
    pub pid: i32,
}

struct Lifecycle {
    state: TaskState,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

struct CachedStats {
    taken: Option<Instant>,
    value: Utilization,
}

/// Per-task record wrapping one supervisor.
///
/// The exit result is committed at most once; every later `block` returns
/// the committed value.
pub struct Handle {
    id: String,
    name: String,
    supervisor: Supervisor,
    waiter: Receiver<ExitResult>,
    lifecycle: RwLock<Lifecycle>,
    wait_lock: Mutex<()>,
    stats: Mutex<CachedStats>,
}

impl Handle {
    /// Wrap a started or recovered supervisor. Both begin in `Running`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        supervisor: Supervisor,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let waiter = supervisor.wait_channel()?;
        Ok(Self {
            id: id.into(),
            name: name.into(),
            supervisor,
            waiter,
            lifecycle: RwLock::new(Lifecycle {
                state: TaskState::Running,
                started_at,
                completed_at: None,
                exit_result: None,
            }),
            wait_lock: Mutex::new(()),
            stats: Mutex::new(CachedStats {
                taken: None,
                value: Utilization::default(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> i32 {
        self.supervisor.pid()
    }

    fn committed(&self) -> Option<ExitResult> {
        self.lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exit_result
            .clone()
    }

    /// Wait for the task to finish and return its exit result.
    ///
    /// Safe to call concurrently: the first caller receives from the waiter
    /// and commits, the others wait on `wait_lock` and read the commit.
    pub fn block(&self) -> ExitResult {
        if let Some(result) = self.committed() {
            return result;
        }

        let _guard = self.wait_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = self.committed() {
            return result;
        }

        let result = self.waiter.recv().unwrap_or_else(|_| {
            ExitResult::failed("exit channel closed before delivering a result")
        });

        let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = &lifecycle.exit_result {
            return existing.clone();
        }
        lifecycle.state = if result.err.is_some() {
            TaskState::Unknown
        } else {
            TaskState::Exited
        };
        lifecycle.completed_at = Some(Utc::now());
        lifecycle.exit_result = Some(result.clone());
        log::info!(
            "Task {} finished: state={} code={}",
            self.id,
            lifecycle.state,
            result.exit_code
        );
        result
    }

    pub fn status(&self) -> TaskStatus {
        let lifecycle = self.lifecycle.read().unwrap_or_else(PoisonError::into_inner);
        TaskStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            state: lifecycle.state,
            started_at: lifecycle.started_at,
            completed_at: lifecycle.completed_at,
            exit_result: lifecycle.exit_result.clone(),
            pid: self.supervisor.pid(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            == TaskState::Running
    }

    /// Utilization snapshot, refreshed when older than `STATS_TTL`.
    pub fn stats(&self) -> Utilization {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> Utilization {
        let mut cache = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = cache
            .taken
            .map(|taken| now.saturating_duration_since(taken) < STATS_TTL)
            .unwrap_or(false);
        if !fresh {
            cache.value = self.supervisor.stats();
            cache.taken = Some(now);
        }
        cache.value.clone()
    }

    pub fn signal(&self, name: &str) -> Result<()> {
        self.supervisor.signal(name)
    }

    pub fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        self.supervisor.stop(name, timeout)
    }

    /// Refuse removal of a running task unless forced.
    pub fn ensure_stopped(&self) -> Result<()> {
        if self.is_running() {
            return Err(SandboxError::TaskRunning(self.id.clone()));
        }
        Ok(())
    }
}
