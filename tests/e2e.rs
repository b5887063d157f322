//! End-to-end sandbox run
//!
//! Needs root, a cgroup v2 hierarchy, landlock and the util-linux namespace
//! tools. Run with `cargo test -- --ignored`.

use nix::sys::stat::Mode;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskbox::config::driver::{DriverConfig, TaskConfig};
use taskbox::driver::Driver;
use taskbox::resources::CpuSpecs;

struct Sandbox {
    _root: tempfile::TempDir,
    task_dir: PathBuf,
    cgroup: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let task_dir = root.path().join("task");
        for dir in ["local", "secrets", "tmp"] {
            std::fs::create_dir_all(task_dir.join(dir)).unwrap();
        }

        let stdout = root.path().join("stdout.fifo");
        let stderr = root.path().join("stderr.fifo");
        for fifo in [&stdout, &stderr] {
            nix::unistd::mkfifo(fifo.as_path(), Mode::from_bits_truncate(0o600)).unwrap();
            drain(fifo.clone());
        }

        let cgroup = PathBuf::from("/sys/fs/cgroup")
            .join(format!("taskbox-e2e-{}.scope", uuid::Uuid::new_v4()));
        std::fs::create_dir(&cgroup).unwrap();

        Self {
            _root: root,
            task_dir,
            cgroup,
            stdout,
            stderr,
        }
    }

    fn task(&self, id: &str, command: &str, args: &[&str]) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            name: id.to_string(),
            user: "root".to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: [("PATH".to_string(), "/usr/bin:/bin".to_string())].into(),
            task_dir: self.task_dir.clone(),
            stdout_path: self.stdout.clone(),
            stderr_path: self.stderr.clone(),
            cgroup: self.cgroup.clone(),
            memory_mb: 128,
            cpu_mhz: 500,
            ..TaskConfig::default()
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.cgroup);
    }
}

fn drain(fifo: PathBuf) {
    thread::spawn(move || {
        if let Ok(mut f) = std::fs::File::open(&fifo) {
            let mut sink = Vec::new();
            let _ = f.read_to_end(&mut sink);
        }
    });
}

fn driver() -> Driver {
    let config = DriverConfig {
        entrypoint: Some(PathBuf::from(env!("CARGO_BIN_EXE_taskbox"))),
        ..DriverConfig::default()
    };
    Driver::with_specs(config, Arc::new(CpuSpecs::from_compute(8000, 4).unwrap()))
}

fn require_privileges() {
    assert!(
        nix::unistd::geteuid().is_root(),
        "end-to-end tests must run as root"
    );
    assert!(
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists(),
        "end-to-end tests need a cgroup v2 hierarchy at /sys/fs/cgroup"
    );
}

#[test]
#[ignore]
fn test_long_running_task_stops_on_sigterm() {
    require_privileges();
    let sandbox = Sandbox::new();
    let driver = driver();
    let state = driver
        .start_task(sandbox.task("sleeper", "sleep", &["infinity"]))
        .unwrap();
    assert!(state.pid > 1);

    let exit = driver.wait_task("sleeper").unwrap();
    assert!(exit.recv_timeout(Duration::from_secs(10)).is_err());

    let cpu_max = std::fs::read_to_string(sandbox.cgroup.join("cpu.max")).unwrap();
    assert_eq!(cpu_max.trim(), "25000 100000");

    let start = Instant::now();
    driver
        .stop_task("sleeper", Duration::from_secs(5), "sigterm")
        .unwrap();
    let result = exit.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_ne!(result.exit_code, 0);

    driver.destroy_task("sleeper", false).unwrap();
}

#[test]
#[ignore]
fn test_exit_code_reaches_recovery_file() {
    require_privileges();
    let sandbox = Sandbox::new();
    let driver = driver();
    driver
        .start_task(sandbox.task("exiter", "sh", &["-c", "exit 7"]))
        .unwrap();

    let result = driver
        .wait_task("exiter")
        .unwrap()
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(result.exit_code, 7);

    let recorded = std::fs::read_to_string(taskbox::exit_status_path(&sandbox.task_dir)).unwrap();
    assert_eq!(recorded, "7");
}
