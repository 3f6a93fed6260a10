//! Reader/writer spin lock backing [`TaskMutex`](super::TaskMutex).
//!
//! A single word of state encodes the whole lock: the low bit is the writer
//! flag, the next bit marks an in-progress upgrade, and the remaining bits
//! count readers. There is no fairness and no parking; callers retry
//! through their own backoff loops and critical sections are expected to
//! be short.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A writer holds the lock.
const WRITER: usize = 1;
/// A reader has claimed the right to upgrade and is waiting for the
/// remaining readers to drain. At most one reader may hold this bit.
const WRITER_PENDING: usize = 1 << 1;
/// Reader count increment.
const ONE_READER: usize = 1 << 2;
const READER_MASK: usize = !(WRITER | WRITER_PENDING);

/// Multiple-reader / single-writer spin lock with in-place upgrade.
///
/// New readers are refused while an upgrade is pending, so the upgrading
/// reader cannot be starved by a steady stream of late arrivals.
pub(crate) struct SpinRwLock {
    state: AtomicUsize,
}

impl SpinRwLock {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Attempts the lock once in the requested mode. Never blocks.
    pub(crate) fn try_acquire(&self, write: bool) -> bool {
        if write {
            self.try_acquire_writer()
        } else {
            self.try_acquire_reader()
        }
    }

    fn try_acquire_writer(&self) -> bool {
        // A writer may only enter a completely free lock. WRITER_PENDING
        // implies its holder still owns a read lock, so the word cannot be
        // zero while an upgrade is in flight.
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn try_acquire_reader(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & (WRITER | WRITER_PENDING) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + ONE_READER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Releases a lock previously obtained through [`try_acquire`] or
    /// [`upgrade_to_writer`].
    ///
    /// [`try_acquire`]: Self::try_acquire
    /// [`upgrade_to_writer`]: Self::upgrade_to_writer
    pub(crate) fn release(&self, write: bool) {
        if write {
            self.state.fetch_and(!WRITER, Ordering::Release);
        } else {
            self.state.fetch_sub(ONE_READER, Ordering::Release);
        }
    }

    /// Converts a held read lock into a write lock, blocking until the
    /// other readers have drained.
    ///
    /// Returns `true` if read access was held continuously throughout the
    /// upgrade. Returns `false` if the read lock had to be released first
    /// (because another reader was already upgrading); the caller then owns
    /// a freshly acquired write lock and must re-validate anything it read.
    pub(crate) fn upgrade_to_writer(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(
                state & READER_MASK >= ONE_READER,
                "upgrade_to_writer requires a held read lock"
            );
            if state & WRITER_PENDING != 0 {
                // Another reader won the upgrade race. Back out so it can
                // drain, then queue up for the write lock from scratch.
                self.release(false);
                self.acquire_writer_spin();
                return false;
            }
            if state == ONE_READER {
                // Sole reader: swap straight to writer.
                match self.state.compare_exchange_weak(
                    state,
                    WRITER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }
            match self.state.compare_exchange_weak(
                state,
                state | WRITER_PENDING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        // We hold WRITER_PENDING plus our own read lock; no new readers can
        // arrive. Wait for the rest to release, then take the writer bit in
        // one step, clearing both our reader count and the pending flag.
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & READER_MASK == ONE_READER
                && self
                    .state
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
            backoff.snooze();
        }
    }

    fn acquire_writer_spin(&self) {
        let backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }
}
