//! Worker thread main loop.

use crossbeam_deque::Steal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::arena::ArenaShared;

/// How long an idle worker sleeps between polls of the injector.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

pub(crate) fn run_loop(index: usize, shared: Arc<ArenaShared>) {
    log::trace!("arena worker {index} started");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match shared.injector.steal() {
            Steal::Success(task) => {
                // A work session: the thread counts as inside the arena
                // from the first task it claims until the queue drains.
                let _session = shared.registry.enter(true);
                task.execute();
                drain(&shared);
            }
            Steal::Empty => thread::sleep(IDLE_SLEEP),
            Steal::Retry => {}
        }
    }
    log::trace!("arena worker {index} stopped");
}

fn drain(shared: &ArenaShared) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        match shared.injector.steal() {
            Steal::Success(task) => task.execute(),
            Steal::Empty => return,
            Steal::Retry => {}
        }
    }
}
