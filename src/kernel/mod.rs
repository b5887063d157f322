//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod cgroup;
pub mod credentials;
pub mod pidfd;
pub mod signal;
pub mod spawn;
pub mod unveil;
