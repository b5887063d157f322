//! Configuration and shared types
//!
//! Error taxonomy, task/driver configuration and the data model shared by
//! the supervisor, waiters and task handles.

pub mod driver;
pub mod types;
