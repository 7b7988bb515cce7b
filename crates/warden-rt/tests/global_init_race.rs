//! Racing first-touch initialization of one global: exactly one
//! initializer wins, and both threads observe the identical object.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use warden_rt::check;
use warden_rt::thread::spawn_managed;
use warden_rt::{heap, CapPtr, GlobalCell};

static CELL: GlobalCell = GlobalCell::new();
static INITIALIZER_RUNS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn two_threads_race_exactly_one_wins() {
    let barrier = Arc::new(Barrier::new(2));
    let mut contenders = Vec::new();

    for _ in 0..2 {
        let barrier = Arc::clone(&barrier);
        contenders.push(spawn_managed(move |thread| {
            barrier.wait();
            let cap = warden_rt::initialize_global(thread, &CELL, |thread, _context| {
                INITIALIZER_RUNS.fetch_add(1, Ordering::Relaxed);
                let object = heap::allocate_global(thread, 32);
                // The winner's side effects are the ones visible afterwards.
                check::write_int_bytes(CapPtr::from_object(object), &[0x5a; 8])
                    .expect("fresh global is writable");
                object
            });
            cap
        }));
    }

    let results: Vec<CapPtr> = contenders
        .into_iter()
        .map(|handle| handle.join().expect("contender finishes"))
        .collect();

    // Exactly one initializer ran.
    assert_eq!(INITIALIZER_RUNS.load(Ordering::Relaxed), 1);

    // Both threads observe the identical resulting object.
    assert_eq!(results[0], results[1]);
    assert_eq!(CELL.load(), results[0]);

    // And the winner's side effects are in place.
    let mut bytes = [0u8; 8];
    check::read_int_bytes(CELL.load(), &mut bytes).unwrap();
    assert_eq!(bytes, [0x5a; 8]);
}
