//! Sandboxed-process lifecycle core.
//!
//! The supervisor launches a process tree into namespaces and a cgroup and
//! observes it through an exit waiter; the shim is the re-executed half of
//! the binary that runs inside the sandbox.

pub mod command;
pub mod shim;
pub mod supervisor;
pub mod types;
pub mod waiter;

pub use supervisor::Supervisor;
pub use types::LaunchMode;
pub use waiter::ExitWaiter;
