//! Task-collaborative synchronization.
//!
//! This crate provides a reader/writer mutex whose waiters donate their
//! otherwise-idle wait time to work spawned by the lock holder:
//! - [`TaskMutex`] / [`ScopedLock`]: the mutex and the scoped handle all
//!   operations flow through
//! - [`Arena`], [`TaskGroup`], [`ArenaObserver`]: the small task-parallel
//!   runtime the mutex schedules donated work on
//! - [`OnceCell`]: one-shot lazy initialization where every waiter helps
//!   build the value it is waiting for
//!
//! The intended workload is expensive, one-shot lazy initialization of a
//! shared resource inside a program that already saturates a fork/join
//! thread pool. Blocking a worker there wastes a core; with [`ScopedLock::execute`],
//! a thread that hits the uninitialized resource either helps initialize
//! it or, if it is already running a piece of that initialization, takes a
//! recursive lock and proceeds.
//!
//! ```
//! use tasklock::{ScopedLock, TaskMutex};
//!
//! let mutex = TaskMutex::new();
//!
//! let mut lock = ScopedLock::new(&mutex, true);
//! let table = lock.execute(|_scope| {
//!     // Runs inside the mutex's arena; waiters for `mutex` execute
//!     // anything spawned through `_scope` instead of blocking.
//!     (0u64..256).map(|i| i * i).collect::<Vec<_>>()
//! });
//! assert_eq!(table[3], 9);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod sync;

pub use arena::{
    Arena, ArenaBuilder, ArenaError, ArenaObserver, SchedulerObserver, TaskGroup, TaskScope,
};
pub use sync::{OnceCell, ScopedLock, TaskMutex};
