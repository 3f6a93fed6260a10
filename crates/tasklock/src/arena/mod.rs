//! A small task-parallel runtime: isolated arenas of worker threads, task
//! groups that waiting threads can help to completion, and observation of
//! the threads currently inside an arena.

#[allow(clippy::module_inception)]
mod arena;
mod observer;
mod task_group;
mod worker;

pub use arena::{Arena, ArenaBuilder, ArenaError};
pub use observer::{ArenaObserver, SchedulerObserver};
pub use task_group::{TaskGroup, TaskScope};
