//! taskbox: a process-sandbox supervisor
//! Launches commands into private namespaces and a cgroup, supervises them to
//! completion and re-attaches to them after the supervisor restarts.
//!
//! # Architecture
//!
//! This crate is organized by Linux kernel primitive families:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: Cgroup v2 limits, usage accounting and kill-all
//! - [`kernel::signal`]: Signal names, process-group delivery, signal absorption
//! - [`kernel::pidfd`]: Race-free waiting on non-child processes
//! - [`kernel::spawn`]: `clone3` straight into the task cgroup
//! - [`kernel::credentials`]: Target user lookup and pipe ownership
//! - [`kernel::unveil`]: Landlock filesystem allow-listing
//!
//! ## Lifecycle Core ([`core`])
//! - [`core::supervisor`]: Start, signal, stop and stats for one process tree
//! - [`core::waiter`]: Direct-child and orphan exit waiting
//! - [`core::command`]: Namespace tool and entrypoint command line
//! - [`core::shim`]: The sandbox entrypoint (re-executed binary)
//!
//! ## Resources ([`resources`])
//! - [`resources::specs`]: Host CPU speed and bandwidth conversion
//! - [`resources::tracker`]: CPU percentage from cumulative counters
//!
//! ## Tasks ([`task`], [`driver`])
//! - [`task::handle`]: Per-task state machine
//! - [`task::store`]: Task registry
//! - [`driver`]: Orchestrator-facing operations and recovery state
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Shared types and the error enum
//! - [`config::driver`]: Driver and task configuration

// Kernel Primitives
pub mod kernel;

// Lifecycle core
pub mod core;

// Resource accounting
pub mod resources;

// Tasks
pub mod driver;
pub mod task;

// Configuration
pub mod config;

// CLI entrypoint wiring for the taskbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
