//! Observation of threads entering and leaving an arena.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::arena::{Arena, ArenaShared};

/// Callbacks invoked as threads join and leave an [`Arena`] to run tasks.
///
/// `on_entry` and `on_exit` run on the thread in question: workers wrap
/// each work session (from the first task claimed until the queue drains),
/// and [`Arena::execute`] wraps the caller's closure. Implementations must
/// keep their critical sections short; callbacks sit on the scheduling
/// path.
pub trait SchedulerObserver: Send + Sync {
    /// The current thread has joined the observed arena. `is_worker` is
    /// true for the arena's own pool threads, false for callers of
    /// [`Arena::execute`].
    fn on_entry(&self, is_worker: bool);

    /// The current thread has left the observed arena.
    fn on_exit(&self, is_worker: bool);
}

/// The observers attached to one arena.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn SchedulerObserver>>>,
}

impl ObserverRegistry {
    pub(crate) fn register(&self, observer: Arc<dyn SchedulerObserver>) {
        self.observers.lock().push(observer);
    }

    pub(crate) fn deregister(&self, observer: &Arc<dyn SchedulerObserver>) {
        let target = Arc::as_ptr(observer) as *const ();
        self.observers
            .lock()
            .retain(|existing| Arc::as_ptr(existing) as *const () != target);
    }

    /// Fires entry callbacks for the current thread and returns a guard
    /// that fires the matching exits on drop. The guard snapshots the
    /// registered set, so an observer attached mid-session sees balanced
    /// callbacks or none at all.
    pub(crate) fn enter(&self, is_worker: bool) -> SessionGuard {
        let snapshot: Vec<_> = self.observers.lock().clone();
        for observer in &snapshot {
            observer.on_entry(is_worker);
        }
        SessionGuard {
            snapshot,
            is_worker,
        }
    }
}

pub(crate) struct SessionGuard {
    snapshot: Vec<Arc<dyn SchedulerObserver>>,
    is_worker: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        for observer in &self.snapshot {
            observer.on_exit(self.is_worker);
        }
    }
}

/// Tracks which threads are currently inside one arena.
///
/// Observation starts at construction and stops when the observer is
/// dropped. The observer must be attached before the arena runs any work
/// and detached only once the arena has shut down, otherwise the set can
/// go stale.
pub struct ArenaObserver {
    shared: Arc<ArenaShared>,
    threads: Arc<ThreadSet>,
}

#[derive(Default)]
struct ThreadSet {
    ids: Mutex<FxHashSet<ThreadId>>,
}

impl SchedulerObserver for ThreadSet {
    fn on_entry(&self, _is_worker: bool) {
        let inserted = self.ids.lock().insert(thread::current().id());
        debug_assert!(inserted, "thread entered the arena twice");
    }

    fn on_exit(&self, _is_worker: bool) {
        let removed = self.ids.lock().remove(&thread::current().id());
        debug_assert!(removed, "thread left the arena without entering");
    }
}

impl ArenaObserver {
    /// Starts observing `arena`.
    pub fn new(arena: &Arena) -> Self {
        let threads = Arc::new(ThreadSet::default());
        let shared = arena.shared();
        shared
            .registry
            .register(Arc::clone(&threads) as Arc<dyn SchedulerObserver>);
        Self { shared, threads }
    }

    /// Is the calling thread currently inside the observed arena?
    pub fn contains_current_thread(&self) -> bool {
        self.threads.ids.lock().contains(&thread::current().id())
    }
}

impl Drop for ArenaObserver {
    fn drop(&mut self) {
        let handle: Arc<dyn SchedulerObserver> = Arc::clone(&self.threads) as Arc<dyn SchedulerObserver>;
        self.shared.registry.deregister(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_marks_thread_inside() {
        let arena = Arena::new();
        let observer = ArenaObserver::new(&arena);

        assert!(!observer.contains_current_thread());
        arena.execute(|| assert!(observer.contains_current_thread()));
        assert!(!observer.contains_current_thread());
    }

    #[test]
    fn test_detached_observer_stops_tracking() {
        let arena = Arena::new();
        let observer = ArenaObserver::new(&arena);
        let threads = Arc::clone(&observer.threads);
        drop(observer);

        arena.execute(|| {
            assert!(!threads.ids.lock().contains(&thread::current().id()));
        });
    }

    #[test]
    fn test_observers_are_independent() {
        let arena = Arena::new();
        let first = ArenaObserver::new(&arena);
        let second = ArenaObserver::new(&arena);
        drop(first);

        arena.execute(|| assert!(second.contains_current_thread()));
        assert!(!second.contains_current_thread());
    }
}
