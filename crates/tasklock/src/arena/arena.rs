//! Isolated execution contexts backed by a dedicated worker pool.

use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use super::observer::ObserverRegistry;
use super::task_group::Task;
use super::worker;

/// Errors produced while building an [`Arena`].
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn arena worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Configures and builds an [`Arena`].
pub struct ArenaBuilder {
    num_threads: usize,
    stack_size: Option<usize>,
    thread_name: String,
}

impl ArenaBuilder {
    /// Creates a builder with the default configuration: one worker per
    /// available CPU, default stack size, `tasklock-worker` name prefix.
    pub fn new() -> Self {
        Self {
            num_threads: 0,
            stack_size: None,
            thread_name: "tasklock-worker".to_string(),
        }
    }

    /// Sets the number of worker threads. Zero selects the available
    /// parallelism of the machine.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Sets the stack size of each worker thread.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets the prefix used to name worker threads.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Spawns the worker pool.
    pub fn build(self) -> Result<Arena, ArenaError> {
        let num_threads = if self.num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            self.num_threads
        };

        let shared = Arc::new(ArenaShared {
            injector: Injector::new(),
            registry: ObserverRegistry::default(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", self.thread_name, index));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let worker_shared = Arc::clone(&shared);
            match builder.spawn(move || worker::run_loop(index, worker_shared)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Tear down the workers spawned so far; a half-built
                    // pool must not outlive the error.
                    shared.shutdown.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ArenaError::Spawn(err));
                }
            }
        }

        Ok(Arena {
            shared,
            handles: Mutex::new(handles),
            num_threads,
        })
    }
}

impl Default for ArenaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An isolated task execution context.
///
/// Work queued into an arena is only ever run by the arena's own workers
/// and by threads that join it through [`execute`] or by helping a
/// [`TaskGroup`](super::TaskGroup) drain. Dropping the arena stops and
/// joins its workers; tasks still queued at that point are drained by
/// whichever group waits on them.
///
/// [`execute`]: Self::execute
pub struct Arena {
    shared: Arc<ArenaShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    num_threads: usize,
}

/// State shared between the arena handle, its workers, and bound groups.
pub(crate) struct ArenaShared {
    pub(crate) injector: Injector<Task>,
    pub(crate) registry: ObserverRegistry,
    pub(crate) shutdown: AtomicBool,
}

impl Arena {
    /// Builds an arena with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if worker threads cannot be spawned; use
    /// [`Arena::builder`] to handle that case.
    pub fn new() -> Self {
        ArenaBuilder::new()
            .build()
            .expect("failed to spawn arena worker threads")
    }

    /// Returns a builder for a customized arena.
    pub fn builder() -> ArenaBuilder {
        ArenaBuilder::new()
    }

    /// Runs `f` on the calling thread, logically joined to the arena:
    /// observers see the thread enter before `f` and leave afterwards,
    /// including on unwind.
    pub fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _session = self.shared.registry.enter(false);
        f()
    }

    /// The number of worker threads owned by this arena.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub(crate) fn shared(&self) -> Arc<ArenaShared> {
        Arc::clone(&self.shared)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        log::trace!("arena shutting down");
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                log::warn!("arena worker panicked during shutdown");
            }
        }
    }
}
