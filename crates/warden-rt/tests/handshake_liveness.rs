//! Soft-handshake and stop-the-world liveness under thread churn.
//!
//! A handshake issued while N threads are alive - some blocked out of the
//! safety envelope, some executing pollcheck-laden loops - must complete
//! with every thread running the callback exactly once, even as threads
//! concurrently enter and exit.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_rt::thread::{spawn_managed, Thread};
use warden_rt::runtime;

fn handshake_records_each_thread_once(num_workers: usize) {
    let _me = Thread::attach_or_current();
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    let mut worker_tids = Vec::new();
    let (tid_tx, tid_rx) = std::sync::mpsc::channel::<u32>();

    for index in 0..num_workers {
        let stop = Arc::clone(&stop);
        let tid_tx = tid_tx.clone();
        workers.push(spawn_managed(move |thread| {
            tid_tx.send(thread.tid()).expect("collector of tids lives");
            drop(tid_tx);
            let mut spins = 0u64;
            while !stop.load(Ordering::Relaxed) {
                spins = spins.wrapping_add(1);
                if index % 2 == 0 {
                    // Pollcheck-laden loop.
                    thread.pollcheck();
                } else {
                    // Enter/exit churn, emulating blocking calls.
                    thread.exit();
                    std::thread::yield_now();
                    thread.enter();
                }
            }
            spins
        }));
    }
    drop(tid_tx);
    for _ in 0..num_workers {
        worker_tids.push(tid_rx.recv().expect("worker reports its tid"));
    }

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    runtime()
        .registry
        .soft_handshake(Arc::new(move |thread: &Thread| {
            seen_in.lock().push(thread.tid());
        }));

    let seen = seen.lock();
    for tid in &worker_tids {
        let occurrences = seen.iter().filter(|other| *other == tid).count();
        assert_eq!(occurrences, 1, "tid {tid} ran the callback {occurrences} times");
    }
    drop(seen);

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().expect("worker exits cleanly");
    }
}

#[test]
fn handshake_with_zero_workers() {
    handshake_records_each_thread_once(0);
}

#[test]
fn handshake_with_four_workers() {
    handshake_records_each_thread_once(4);
}

#[test]
fn handshake_with_sixteen_workers() {
    handshake_records_each_thread_once(16);
}

#[test]
fn repeated_handshakes_under_churn() {
    let _me = Thread::attach_or_current();
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for _ in 0..8 {
        let stop = Arc::clone(&stop);
        workers.push(spawn_managed(move |thread| {
            while !stop.load(Ordering::Relaxed) {
                thread.pollcheck();
                thread.exit();
                thread.enter();
            }
        }));
    }

    for _ in 0..50 {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        runtime()
            .registry
            .soft_handshake(Arc::new(move |_thread: &Thread| {
                hits_in.fetch_add(1, Ordering::Relaxed);
            }));
        assert!(hits.load(Ordering::Relaxed) >= 1);
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().expect("worker exits cleanly");
    }
}

#[test]
fn stop_the_world_halts_pollchecking_loops() {
    let _me = Thread::attach_or_current();
    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..4 {
        let stop = Arc::clone(&stop);
        let progress = Arc::clone(&progress);
        workers.push(spawn_managed(move |thread| {
            while !stop.load(Ordering::Relaxed) {
                progress.fetch_add(1, Ordering::Relaxed);
                thread.pollcheck();
            }
        }));
    }

    // Let the workers spin up.
    while progress.load(Ordering::Relaxed) < 100 {
        std::thread::yield_now();
    }

    runtime().registry.stop_the_world();
    // Nested stop is a cheap no-op beyond the outer pair.
    runtime().registry.stop_the_world();

    let frozen = progress.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        progress.load(Ordering::Relaxed),
        frozen,
        "a stopped world made progress"
    );

    runtime().registry.resume_the_world();
    runtime().registry.resume_the_world();

    let resumed_from = progress.load(Ordering::Relaxed);
    while progress.load(Ordering::Relaxed) == resumed_from {
        std::thread::yield_now();
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().expect("worker exits cleanly");
    }
}
