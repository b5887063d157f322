//! Task handles and the task registry.

pub mod handle;
pub mod store;

pub use handle::{Handle, TaskStatus, STATS_TTL};
pub use store::{Reservation, TaskStore};
