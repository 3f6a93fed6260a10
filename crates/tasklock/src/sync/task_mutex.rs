//! A mutex whose waiters collaborate on tasks spawned by the holder.

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;

use super::rwlock::SpinRwLock;
use crate::arena::{Arena, ArenaObserver, TaskGroup, TaskScope};

/// Mutex where threads waiting for access can collaborate on tasks spawned
/// by the holder. Useful for performing expensive delayed initialization
/// of shared resources inside an already-saturated task-parallel workload:
/// instead of blocking idly, each waiter helps build the very value it is
/// waiting for.
///
/// Simple usage:
///
/// ```
/// use tasklock::{ScopedLock, TaskMutex};
///
/// let mutex = TaskMutex::new();
/// let mut initialized = false;
///
/// let mut lock = ScopedLock::new(&mutex, true);
/// if !initialized {
///     lock.execute(|_scope| {
///         // expensive initialization; fan out through `_scope.spawn`
///     });
///     initialized = true;
/// }
/// // Use the resource here, while the lock is still held.
/// ```
///
/// Improved concurrency via reader locks: take a reader lock
/// optimistically, and only upgrade to a writer lock when initialization
/// turns out to be necessary (checking again afterwards, since the upgrade
/// may have admitted another writer first). [`OnceCell`](super::OnceCell)
/// packages that pattern.
pub struct TaskMutex {
    /// The lock actually held by a [`ScopedLock`].
    rw: SpinRwLock,
    /// The collaboration window published by `execute`, guarded by its own
    /// mutex. Non-`None` exactly while some writer is inside `execute`.
    execution_state: Mutex<Option<Arc<ExecutionState>>>,
}

/// The mechanism through which waiting threads participate in the work
/// done by `execute`.
struct ExecutionState {
    /// Arena and group used to run the donated work. Declared before
    /// `observer` so the arena's workers are joined, and fire their exit
    /// callbacks, while the observer is still attached.
    arena: Arena,
    group: TaskGroup,
    /// Tracks which threads are currently inside `arena`, so any thread
    /// already working on behalf of `execute` can be granted a recursive
    /// lock.
    observer: ArenaObserver,
}

impl ExecutionState {
    fn new() -> Arc<Self> {
        let arena = Arena::new();
        let group = TaskGroup::new(&arena);
        // Attached before any task is queued, so no entry can be missed.
        let observer = ArenaObserver::new(&arena);
        Arc::new(Self {
            arena,
            group,
            observer,
        })
    }
}

impl TaskMutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            rw: SpinRwLock::new(),
            execution_state: Mutex::new(None),
        }
    }

    /// Acquires the mutex, accepting work while waiting, and returns the
    /// holding lock. Shorthand for [`ScopedLock::new`].
    pub fn lock(&self, write: bool) -> ScopedLock<'_> {
        ScopedLock::new(self, write)
    }
}

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a lock on a [`TaskMutex`] and releases it on drop.
///
/// All operations on the mutex flow through this handle: acquisition in
/// either mode, upgrade, release, and the writer-side [`execute`]. The
/// handle starts idle ([`ScopedLock::default`]), holds at most one lock at
/// a time, and is intentionally not `Send`: a lock must be released from
/// the scope that acquired it.
///
/// [`execute`]: Self::execute
pub struct ScopedLock<'a> {
    mutex: Option<&'a TaskMutex>,
    writer: bool,
    recursive: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> ScopedLock<'a> {
    /// Acquires `mutex` in the requested mode, accepting work while
    /// waiting, and returns the holding lock.
    pub fn new(mutex: &'a TaskMutex, write: bool) -> Self {
        let mut lock = Self::default();
        lock.acquire(mutex, write, true);
        lock
    }

    /// Acquires a lock on `mutex`, blocking until it is held in the
    /// requested mode. If `accept_work` is true, the calling thread
    /// donates its wait time to any tasks the current holder has spawned
    /// through [`execute`]; otherwise it backs off and retries.
    ///
    /// [`execute`]: Self::execute
    pub fn acquire(&mut self, mutex: &'a TaskMutex, write: bool, accept_work: bool) {
        let backoff = Backoff::new();
        while !self.acquire_or(mutex, write, |_| accept_work) {
            backoff.snooze();
        }
    }

    /// Attempts the lock once, without donating. Returns true iff it was
    /// acquired; on failure the handle stays idle.
    ///
    /// A thread that is currently executing work on behalf of the holder's
    /// [`execute`] is granted a recursive lock here, exactly as in
    /// [`acquire_or`]. The grant is always shared, whatever mode was
    /// requested.
    ///
    /// [`acquire_or`]: Self::acquire_or
    /// [`execute`]: Self::execute
    pub fn try_acquire(&mut self, mutex: &'a TaskMutex, write: bool) -> bool {
        self.acquire_or(mutex, write, |_| false)
    }

    /// Tries to acquire the mutex, returning true on success. On failure,
    /// calls `work_notifier(work_available)`. If work is available and the
    /// notifier returns true, the calling thread joins the holder's arena
    /// and runs its queued tasks until the group empties. Returns false on
    /// failure regardless of whether work was done; the caller must retry.
    ///
    /// The one exception to "failure": a thread that is already executing
    /// donated work for the current holder is granted a **recursive**
    /// lock, so the work it runs may safely re-enter the mutex. Recursive
    /// grants are always shared-mode, whatever mode was requested, and
    /// never touch the underlying lock.
    pub fn acquire_or<F>(&mut self, mutex: &'a TaskMutex, write: bool, work_notifier: F) -> bool
    where
        F: FnOnce(bool) -> bool,
    {
        debug_assert!(self.mutex.is_none(), "ScopedLock is already acquired");

        if mutex.rw.try_acquire(write) {
            self.mutex = Some(mutex);
            self.writer = write;
            self.recursive = false;
            return true;
        }

        // Failed to acquire by regular means; consider our relationship
        // with any collaboration window published by a current `execute`.
        let state = {
            let slot = mutex.execution_state.lock();
            if let Some(state) = slot.as_ref() {
                if state.observer.contains_current_thread() {
                    // Already doing work on behalf of `execute`, so a
                    // recursive lock is safe: the writer that owns the
                    // window is waiting on this very work.
                    self.mutex = Some(mutex);
                    self.writer = false;
                    self.recursive = true;
                    return true;
                }
            }
            let work_available = slot.is_some();
            if !work_notifier(work_available) || !work_available {
                return false;
            }
            match slot.as_ref() {
                Some(state) => Arc::clone(state),
                None => return false,
            }
        };

        // Donate: join the holder's arena and drain its task group. The
        // cloned state keeps arena and group alive even if the holder
        // retracts the window while we drain.
        log::trace!("donating lock wait time to the holder's task group");
        state.arena.execute(|| state.group.wait_all());
        false
    }

    /// Upgrades a previously-acquired reader lock to a full writer lock.
    /// Returns true if the upgrade happened without temporarily releasing
    /// the lock, and false otherwise; in the latter case the caller must
    /// re-validate whatever it read, since another writer may have run.
    /// Either way the handle holds a writer lock afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the handle is idle. Must only be called on a
    /// non-recursive reader lock.
    pub fn upgrade_to_writer(&mut self) -> bool {
        let mutex = self.expect_held("upgrade_to_writer");
        debug_assert!(
            !self.writer && !self.recursive,
            "upgrade_to_writer requires a non-recursive reader lock"
        );
        self.writer = true;
        mutex.rw.upgrade_to_writer()
    }

    /// Runs `f` in a way that lets threads waiting for this mutex execute
    /// tasks on its behalf: everything spawned through the
    /// [`TaskScope`] handed to `f` may be picked up by waiters that
    /// accepted work.
    ///
    /// Returns `f`'s result once every spawned task has finished. If `f`
    /// or any task it spawned panics, the group still drains, the
    /// collaboration window is retracted, and the first panic is then
    /// re-raised on this thread; donors never observe it.
    ///
    /// # Panics
    ///
    /// Panics if the handle is idle, and re-raises panics from `f` as
    /// described above. Must only be called while holding a non-recursive
    /// writer lock.
    pub fn execute<'scope, F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&TaskScope<'scope>) -> R + Send + 'scope,
        R: Send,
    {
        let mutex = self.expect_held("execute");
        debug_assert!(
            self.writer && !self.recursive,
            "execute requires a non-recursive writer lock"
        );

        let state = ExecutionState::new();
        {
            let mut slot = mutex.execution_state.lock();
            debug_assert!(slot.is_none(), "execute is already running on this mutex");
            *slot = Some(Arc::clone(&state));
        }
        // Retract the window even if the arena call below unwinds.
        let clear = ClearStateOnDrop { mutex };

        let result: Mutex<Option<R>> = Mutex::new(None);
        {
            let scope = TaskScope::new(state.group.clone());
            let result = &result;
            let root = move || {
                *result.lock() = Some(f(&scope));
            };
            state.arena.execute(|| {
                // Spawning and waiting are deliberately separate steps:
                // combining them would let unrelated waiters return from
                // their own wait before the group is empty.
                //
                // SAFETY: `wait_all` below does not return until the group
                // has drained, and the group cannot drain before `root`
                // has run, so the borrows captured by `root` are live for
                // its whole execution.
                unsafe { state.group.spawn_unchecked(root) };
                state.group.wait_all();
            });
        }

        drop(clear);

        if let Some(payload) = state.group.take_panic() {
            panic::resume_unwind(payload);
        }
        match result.into_inner() {
            Some(value) => value,
            None => unreachable!("task group drained without running the spawned closure"),
        }
    }

    /// Releases the lock. Done automatically on drop, but may be called
    /// explicitly to release early. A recursive lock never touches the
    /// underlying reader/writer lock, which stays with its real owner.
    ///
    /// # Panics
    ///
    /// Panics if the handle is idle.
    pub fn release(&mut self) {
        let mutex = self.expect_held("release");
        if !self.recursive {
            mutex.rw.release(self.writer);
        }
        self.mutex = None;
    }

    /// True while this handle holds a lock.
    pub fn is_acquired(&self) -> bool {
        self.mutex.is_some()
    }

    /// True if the held lock is a writer lock.
    pub fn is_writer(&self) -> bool {
        self.writer
    }

    /// Returns true if acquisition produced a recursive lock rather than
    /// a unique one. Recursive locks are available to any thread
    /// performing work on behalf of [`execute`](Self::execute).
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    fn expect_held(&self, operation: &str) -> &'a TaskMutex {
        match self.mutex {
            Some(mutex) => mutex,
            None => panic!("{operation} called on a ScopedLock that holds no lock"),
        }
    }
}

impl Default for ScopedLock<'_> {
    fn default() -> Self {
        Self {
            mutex: None,
            writer: false,
            recursive: false,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if self.mutex.is_some() {
            self.release();
        }
    }
}

struct ClearStateOnDrop<'a> {
    mutex: &'a TaskMutex,
}

impl Drop for ClearStateOnDrop<'_> {
    fn drop(&mut self) {
        *self.mutex.execution_state.lock() = None;
    }
}
