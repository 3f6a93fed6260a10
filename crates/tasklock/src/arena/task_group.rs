//! Groups of tasks that waiting threads can help to completion.

use crossbeam_deque::Steal;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::arena::{Arena, ArenaShared};

type Job = Box<dyn FnOnce() + Send + 'static>;
type PanicPayload = Box<dyn Any + Send + 'static>;

/// A queued unit of work, tagged with the group that tracks it.
pub(crate) struct Task {
    job: Job,
    group: Arc<GroupState>,
}

impl Task {
    /// Runs the task. Panics are captured into the group so the queue can
    /// keep draining on whatever thread picked the task up.
    pub(crate) fn execute(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(self.job));
        if let Err(payload) = result {
            self.group.record_panic(payload);
        }
        self.group.pending.fetch_sub(1, Ordering::Release);
    }
}

struct GroupState {
    /// Tasks spawned but not yet finished. Incremented before a task is
    /// queued, so the count cannot reach zero while a live task is still
    /// producing work.
    pending: AtomicUsize,
    /// First panic payload captured from a task of this group.
    panic: Mutex<Option<PanicPayload>>,
}

impl GroupState {
    fn record_panic(&self, payload: PanicPayload) {
        let mut slot = self.panic.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }
}

/// A handle onto a set of tasks scheduled into one [`Arena`].
///
/// Clones share the same underlying group: spawning through any clone adds
/// to the same pending set, and `wait_all` on any clone waits for all of
/// them.
#[derive(Clone)]
pub struct TaskGroup {
    shared: Arc<ArenaShared>,
    state: Arc<GroupState>,
}

impl TaskGroup {
    /// Creates an empty group bound to `arena`.
    pub fn new(arena: &Arena) -> Self {
        Self {
            shared: arena.shared(),
            state: Arc::new(GroupState {
                pending: AtomicUsize::new(0),
                panic: Mutex::new(None),
            }),
        }
    }

    /// Queues `f` into the group's arena.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_job(Box::new(f));
    }

    /// Queues a closure whose borrows are only promised to outlive its own
    /// execution, not `'static`.
    ///
    /// # Safety
    ///
    /// The caller must not return control to the frame owning the
    /// closure's borrows until the group has drained. [`wait_all`] on the
    /// thread that spawned provides exactly that guarantee.
    ///
    /// [`wait_all`]: Self::wait_all
    pub(crate) unsafe fn spawn_unchecked<'env, F>(&self, f: F)
    where
        F: FnOnce() + Send + 'env,
    {
        let job: Box<dyn FnOnce() + Send + 'env> = Box::new(f);
        let job: Job = unsafe { mem::transmute(job) };
        self.push_job(job);
    }

    fn push_job(&self, job: Job) {
        self.state.pending.fetch_add(1, Ordering::Relaxed);
        self.shared.injector.push(Task {
            job,
            group: Arc::clone(&self.state),
        });
    }

    /// Blocks until every task of the group has finished, running queued
    /// arena tasks on the calling thread while it waits.
    ///
    /// Panics raised by tasks do not escape here; they are retained for
    /// [`take_panic`]. A thread helping through `wait_all` is not marked
    /// as inside the arena; wrap the call in [`Arena::execute`] when
    /// observers should see it.
    ///
    /// [`take_panic`]: Self::take_panic
    pub fn wait_all(&self) {
        let backoff = Backoff::new();
        while self.state.pending.load(Ordering::Acquire) != 0 {
            match self.shared.injector.steal() {
                Steal::Success(task) => {
                    task.execute();
                    backoff.reset();
                }
                Steal::Empty => backoff.snooze(),
                Steal::Retry => {}
            }
        }
    }

    /// True once every spawned task has finished.
    pub fn is_empty(&self) -> bool {
        self.state.pending.load(Ordering::Acquire) == 0
    }

    /// Removes and returns the first panic captured from this group's
    /// tasks, if any.
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.state.panic.lock().take()
    }
}

/// Spawn handle passed to closures run through
/// [`ScopedLock::execute`](crate::sync::ScopedLock::execute).
///
/// Tasks spawned through a scope may borrow from the environment of the
/// `execute` call; the lock guarantees they all finish before `execute`
/// returns. The scope can be cloned into spawned tasks to spawn further
/// work from inside them.
#[derive(Clone)]
pub struct TaskScope<'scope> {
    group: TaskGroup,
    _marker: PhantomData<fn(&'scope ()) -> &'scope ()>,
}

impl<'scope> TaskScope<'scope> {
    pub(crate) fn new(group: TaskGroup) -> Self {
        Self {
            group,
            _marker: PhantomData,
        }
    }

    /// Spawns `f` into the task group being executed.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        // SAFETY: the pending count is raised before the job is queued and
        // the frame that created this scope waits for the count to reach
        // zero before returning, so the job cannot outlive its borrows.
        unsafe { self.group.spawn_unchecked(f) };
    }
}
