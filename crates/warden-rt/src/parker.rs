//! Address-keyed park/unpark.
//!
//! Condition-variable-like primitive keyed on an arbitrary address. A
//! parking thread evaluates a predicate under the per-address queue lock
//! (so a racing unpark cannot be missed), then sleeps until an unpark on
//! the same address or an absolute timeout. Recursive parking on the same
//! thread is a fatal usage error, not a recoverable condition.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::violation::{Violation, ViolationKind};

/// Why a park call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// The predicate said not to park; the thread never slept.
    NotParked,
    /// Woken by an unpark on the same address.
    Unparked,
    /// The absolute timeout elapsed.
    TimedOut,
}

pub(crate) struct Bucket {
    state: Mutex<BucketState>,
    cond: Condvar,
}

#[derive(Default)]
struct BucketState {
    waiters: usize,
    /// Wake tokens produced by unpark and consumed by parked threads.
    tokens: usize,
}

/// The process-wide parking lot.
pub struct Parker {
    buckets: Mutex<HashMap<usize, Arc<Bucket>>>,
}

thread_local! {
    static PARKED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, addr: usize) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock();
        Arc::clone(buckets.entry(addr).or_insert_with(|| {
            Arc::new(Bucket {
                state: Mutex::new(BucketState::default()),
                cond: Condvar::new(),
            })
        }))
    }

    fn release_bucket(&self, addr: usize, bucket: &Arc<Bucket>) {
        let mut buckets = self.buckets.lock();
        if bucket.state.lock().waiters == 0 {
            buckets.remove(&addr);
        }
    }

    /// Parks the calling thread on `addr`.
    ///
    /// `validate` runs under the queue lock; returning `false` aborts the
    /// park without sleeping. `deadline` is absolute; `None` parks forever.
    ///
    /// # Errors
    ///
    /// Returns a `RuntimeBug` violation if the calling thread is already
    /// parked (recursive parking).
    pub fn park(
        &self,
        addr: usize,
        validate: impl FnOnce() -> bool,
        deadline: Option<Instant>,
    ) -> Result<ParkResult, Violation> {
        if PARKED.with(std::cell::Cell::get) {
            return Err(Violation::new(
                ViolationKind::RuntimeBug,
                format!("recursive park on address {addr:#x}"),
            ));
        }
        PARKED.with(|parked| parked.set(true));
        let result = self.park_inner(addr, validate, deadline);
        PARKED.with(|parked| parked.set(false));
        Ok(result)
    }

    fn park_inner(
        &self,
        addr: usize,
        validate: impl FnOnce() -> bool,
        deadline: Option<Instant>,
    ) -> ParkResult {
        let bucket = self.bucket(addr);
        let mut state = bucket.state.lock();

        if !validate() {
            drop(state);
            self.release_bucket(addr, &bucket);
            return ParkResult::NotParked;
        }

        state.waiters += 1;
        let result = loop {
            if state.tokens > 0 {
                state.tokens -= 1;
                break ParkResult::Unparked;
            }
            match deadline {
                Some(deadline) => {
                    if bucket.cond.wait_until(&mut state, deadline).timed_out() {
                        break ParkResult::TimedOut;
                    }
                }
                None => bucket.cond.wait(&mut state),
            }
        };
        state.waiters -= 1;
        drop(state);
        self.release_bucket(addr, &bucket);
        result
    }

    /// Wakes at most one thread parked on `addr`. Returns whether a waiter
    /// was present.
    pub fn unpark_one(&self, addr: usize) -> bool {
        let bucket = self.bucket(addr);
        let mut state = bucket.state.lock();
        let had_waiter = state.waiters > state.tokens;
        if had_waiter {
            state.tokens += 1;
            bucket.cond.notify_one();
        }
        drop(state);
        self.release_bucket(addr, &bucket);
        had_waiter
    }

    /// Wakes every thread parked on `addr`. Returns the number woken.
    pub fn unpark_all(&self, addr: usize) -> usize {
        let bucket = self.bucket(addr);
        let mut state = bucket.state.lock();
        let woken = state.waiters.saturating_sub(state.tokens);
        state.tokens += woken;
        bucket.cond.notify_all();
        drop(state);
        self.release_bucket(addr, &bucket);
        woken
    }

    /// Holds the bucket-map lock for the duration of a fork, so the child
    /// inherits a consistent parking lot.
    pub(crate) fn lock_for_fork(&self) -> MutexGuard<'_, HashMap<usize, Arc<Bucket>>> {
        self.buckets.lock()
    }
}
