//! Synchronization primitives built around work donation.

mod once_cell;
mod rwlock;
mod task_mutex;

pub use once_cell::OnceCell;
pub use task_mutex::{ScopedLock, TaskMutex};
