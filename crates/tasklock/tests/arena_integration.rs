//! Integration tests for the arena runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tasklock::{Arena, ArenaObserver, TaskGroup};

/// Polls until the group drains without ever helping, so every task is
/// guaranteed to run on an arena worker.
fn wait_without_helping(group: &TaskGroup) {
    while !group.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_workers_drain_the_queue_unaided() {
    let arena = Arena::builder().num_threads(2).build().unwrap();
    let group = TaskGroup::new(&arena);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        group.spawn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }
    wait_without_helping(&group);

    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn test_worker_threads_carry_the_configured_name() {
    let arena = Arena::builder()
        .num_threads(1)
        .thread_name("bench-pool")
        .build()
        .unwrap();
    let group = TaskGroup::new(&arena);
    let name = Arc::new(Mutex::new(String::new()));

    let task_name = Arc::clone(&name);
    group.spawn(move || {
        let current = thread::current().name().unwrap_or("").to_string();
        *task_name.lock().unwrap() = current;
    });
    wait_without_helping(&group);

    assert_eq!(name.lock().unwrap().as_str(), "bench-pool-0");
}

#[test]
fn test_wait_all_helps_from_the_calling_thread() {
    // A single worker against fifty queued tasks: the waiting thread
    // races it through the queue, and wait_all must not return until
    // every task has run, whoever ran it.
    let arena = Arena::builder().num_threads(1).build().unwrap();
    let group = TaskGroup::new(&arena);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let counter = Arc::clone(&counter);
        group.spawn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }
    group.wait_all();

    assert_eq!(counter.load(Ordering::Relaxed), 50);
    assert!(group.is_empty());
}

#[test]
fn test_tasks_observe_their_thread_inside_the_arena() {
    let arena = Arena::new();
    let observer = Arc::new(ArenaObserver::new(&arena));
    let group = TaskGroup::new(&arena);

    assert!(!observer.contains_current_thread());

    let seen_inside = Arc::new(AtomicBool::new(false));
    let task_observer = Arc::clone(&observer);
    let task_seen = Arc::clone(&seen_inside);
    group.spawn(move || {
        task_seen.store(task_observer.contains_current_thread(), Ordering::Relaxed);
    });
    arena.execute(|| group.wait_all());

    assert!(seen_inside.load(Ordering::Relaxed));
    assert!(!observer.contains_current_thread());
}

#[test]
fn test_group_panic_does_not_poison_the_arena() {
    let arena = Arena::builder().num_threads(2).build().unwrap();
    let group = TaskGroup::new(&arena);

    group.spawn(|| panic!("worker task failure"));
    group.wait_all();
    assert!(group.take_panic().is_some());

    // The pool keeps working afterwards.
    let counter = Arc::new(AtomicUsize::new(0));
    let task_counter = Arc::clone(&counter);
    group.spawn(move || {
        task_counter.fetch_add(1, Ordering::Relaxed);
    });
    group.wait_all();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(group.take_panic().is_none());
}
