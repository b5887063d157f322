/// Driver and task configuration loaded from JSON
use crate::config::types::{Environment, Result, SandboxError, SandboxSpec};
use crate::resources::specs::CpuSpecs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// Driver-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Automatically unveil the task, alloc, secrets and tmp directories
    #[serde(default = "default_true")]
    pub unveil_defaults: bool,
    /// Allow tasks to add their own unveil rules
    #[serde(default)]
    pub unveil_by_task: bool,
    /// Extra `mode:path` rules applied to every task
    #[serde(default)]
    pub unveil_paths: Vec<String>,
    /// Total host compute in MHz; overrides detection together with `cpu_cores`
    #[serde(default)]
    pub cpu_total_compute: Option<u64>,
    /// Host core count used with `cpu_total_compute`
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    /// Binary re-executed as the sandbox entrypoint; defaults to the running executable
    #[serde(default)]
    pub entrypoint: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            unveil_defaults: true,
            unveil_by_task: false,
            unveil_paths: Vec::new(),
            cpu_total_compute: None,
            cpu_cores: None,
            entrypoint: None,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Config(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Resolve the CPU speed used for bandwidth and tick conversion.
    pub fn cpu_specs(&self) -> Result<CpuSpecs> {
        match (self.cpu_total_compute, self.cpu_cores) {
            (Some(total), Some(cores)) => CpuSpecs::from_compute(total, cores),
            (None, None) => CpuSpecs::detect(),
            _ => Err(SandboxError::Config(
                "cpu_total_compute and cpu_cores must be set together".to_string(),
            )),
        }
    }

    /// Combine driver, default and task unveil rules for one task.
    pub fn unveil_rules(&self, task: &TaskConfig) -> Result<Vec<String>> {
        let mut rules = self.unveil_paths.clone();

        if self.unveil_defaults {
            for dir in ["local", "secrets", "tmp"] {
                rules.push(format!("rwxc:{}", task.task_dir.join(dir).display()));
            }
            if let Some(alloc_dir) = &task.alloc_dir {
                rules.push(format!("rwxc:{}", alloc_dir.display()));
            }
        }

        if !task.unveil.is_empty() {
            if !self.unveil_by_task {
                return Err(SandboxError::Config(
                    "task set unveil paths but driver config does not allow this".to_string(),
                ));
            }
            rules.extend(task.unveil.iter().cloned());
        }

        Ok(rules)
    }
}

/// Per-task configuration handed over by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    /// User the task runs as; must be set
    pub user: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Task-provided unveil rules (`mode:path`)
    #[serde(default)]
    pub unveil: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub task_dir: PathBuf,
    #[serde(default)]
    pub alloc_dir: Option<PathBuf>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Task cgroup directory (cgroup v2)
    pub cgroup: PathBuf,
    #[serde(default)]
    pub network_namespace: Option<PathBuf>,
    pub memory_mb: u64,
    #[serde(default)]
    pub memory_max_mb: u64,
    /// Requested CPU in MHz
    pub cpu_mhz: u64,
    #[serde(default)]
    pub oom_score_adj: i32,
}

impl TaskConfig {
    /// Load a task configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Config(format!("Failed to read task file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse task JSON: {}", e)))
    }

    /// Assign a random ID when the orchestrator did not provide one.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Runtime environment for this task.
    pub fn environment(&self, cpu_bandwidth: u64) -> Environment {
        Environment {
            user: self.user.clone(),
            out_pipe: self.stdout_path.clone(),
            err_pipe: self.stderr_path.clone(),
            env: self.env.clone(),
            task_dir: self.task_dir.clone(),
            cgroup: self.cgroup.clone(),
            network_namespace: self.network_namespace.clone(),
            memory: self.memory_mb * 1024 * 1024,
            memory_max: self.memory_max_mb * 1024 * 1024,
            cpu_bandwidth,
            oom_score_adj: self.oom_score_adj,
        }
    }

    /// Sandbox specification for this task, given the composed unveil rules.
    pub fn sandbox_spec(&self, unveil_paths: Vec<String>, unveil_defaults: bool) -> SandboxSpec {
        SandboxSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            unveil_paths,
            unveil_defaults,
        }
    }
}
