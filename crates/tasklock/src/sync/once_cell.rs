//! One-shot lazy initialization on top of [`TaskMutex`].

use std::cell::UnsafeCell;
use std::convert::Infallible;

use super::task_mutex::{ScopedLock, TaskMutex};
use crate::arena::TaskScope;

/// A cell initialized at most once, by an initializer that threads blocked
/// on the same cell help to completion.
///
/// Readers take the cell's lock optimistically in shared mode; the first
/// thread to find the cell empty upgrades to a writer lock, double-checks,
/// and runs the initializer through
/// [`ScopedLock::execute`], so anything the
/// initializer spawns through its [`TaskScope`] is fair game for waiting
/// threads to pick up.
///
/// ```
/// use tasklock::OnceCell;
///
/// static TABLE: OnceCell<Vec<u64>> = OnceCell::new();
///
/// let table = TABLE.get_or_init(|_scope| (0..64).map(|i| i * i).collect());
/// assert_eq!(table[8], 64);
/// ```
pub struct OnceCell<T> {
    mutex: TaskMutex,
    /// Written at most once, under the writer lock; never unset.
    value: UnsafeCell<Option<T>>,
}

// SAFETY: access to `value` is mediated by `mutex` until the single write
// has happened, and it is immutable afterwards.
unsafe impl<T: Send> Send for OnceCell<T> {}
unsafe impl<T: Send + Sync> Sync for OnceCell<T> {}

impl<T: Send> OnceCell<T> {
    /// Creates an empty cell.
    pub const fn new() -> Self {
        Self {
            mutex: TaskMutex::new(),
            value: UnsafeCell::new(None),
        }
    }

    /// Returns the value if the cell is initialized.
    ///
    /// Blocks while an initializer is running, donating to it like any
    /// other waiter, unless called from inside that initializer's own
    /// donated work, in which case it returns `None`.
    pub fn get(&self) -> Option<&T> {
        let mut lock = ScopedLock::default();
        lock.acquire(&self.mutex, false, true);
        // SAFETY: shared access is held, and once the slot is `Some` it is
        // never written again, so the reference stays valid after release.
        unsafe { (*self.value.get()).as_ref() }
    }

    /// Returns the value, running `f` to initialize it first if the cell
    /// is empty. Concurrent callers race to initialize; exactly one `f`
    /// runs and the rest donate their wait to it.
    ///
    /// # Panics
    ///
    /// Panics if `f` does, leaving the cell empty, or if called
    /// reentrantly from the cell's own initializer.
    pub fn get_or_init<'env, F>(&self, f: F) -> &T
    where
        F: FnOnce(&TaskScope<'env>) -> T + Send + 'env,
    {
        match self.get_or_try_init(|scope| Ok::<T, Infallible>(f(scope))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`get_or_init`]: an `Err` from `f` is returned to
    /// the caller and leaves the cell empty, so a later call may retry.
    ///
    /// [`get_or_init`]: Self::get_or_init
    ///
    /// # Panics
    ///
    /// Panics if `f` does, or if called reentrantly from the cell's own
    /// initializer.
    pub fn get_or_try_init<'env, F, E>(&self, f: F) -> Result<&T, E>
    where
        F: FnOnce(&TaskScope<'env>) -> Result<T, E> + Send + 'env,
        E: Send,
    {
        let mut lock = ScopedLock::default();
        lock.acquire(&self.mutex, false, true);

        // SAFETY: shared access is held; see `get`.
        if let Some(value) = unsafe { (*self.value.get()).as_ref() } {
            return Ok(value);
        }

        if lock.recursive() {
            // The cell's own initializer looped back into the cell; the
            // value can never materialize on this path.
            panic!("reentrant initialization of OnceCell");
        }

        // The upgrade may admit another initializer first, hence the
        // second emptiness check below.
        lock.upgrade_to_writer();

        if unsafe { (*self.value.get()).is_none() } {
            let value = lock.execute(f)?;
            // SAFETY: writer lock held and the slot is still empty.
            unsafe { *self.value.get() = Some(value) };
        }

        // SAFETY: the slot was filled above, by us or by the writer that
        // won the upgrade, and is never written again.
        match unsafe { (*self.value.get()).as_ref() } {
            Some(value) => Ok(value),
            None => unreachable!("cell still empty after initialization"),
        }
    }
}

impl<T: Send> Default for OnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
