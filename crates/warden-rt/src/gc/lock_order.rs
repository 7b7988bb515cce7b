//! Lock ordering discipline for deadlock prevention.
//!
//! The runtime's coarse locks must be acquired in a fixed order:
//!
//! | Level | Lock            | Description                                |
//! |-------|-----------------|--------------------------------------------|
//! | 1     | `Collector`     | Cycle driver / fork quiescence             |
//! | 2     | `Handshake`     | Soft-handshake serialization               |
//! | 2     | `StopTheWorld`  | Stop-the-world nesting count               |
//! | 3     | `ThreadList`    | Live thread set snapshot                   |
//! | 4     | `ThreadSelf`    | A single thread's coordination lock        |
//!
//! Locks are acquired in increasing level; same-level locks may be taken in
//! any order relative to each other. Leaf locks (frame stacks, mark stacks,
//! table locks, parker buckets) are never held across an acquisition of any
//! lock in this table and are not tracked.
//!
//! In debug builds [`LockGuard`] validates the order on acquisition; in
//! release builds the whole module compiles to nothing.

use std::cell::{Cell, RefCell};

const MAX_LOCK_DEPTH: usize = 16;

#[cfg_attr(not(debug_assertions), allow(dead_code))]
struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Collector cycle lock (level 1). Held for the duration of a cycle and
    /// by fork to quiesce collection.
    Collector = 1,

    /// Soft-handshake serialization lock (level 2). At most one handshake is
    /// in flight at a time.
    Handshake = 2,

    /// Stop-the-world state lock (level 2). Guards the nesting count.
    StopTheWorld = 3,

    /// Live thread list lock (level 3). Held only for snapshots and
    /// registration changes.
    ThreadList = 4,

    /// A single thread's coordination lock (level 4). Innermost; guards the
    /// pollcheck callback slot and pairs with the thread's condvar.
    ThreadSelf = 5,
}

impl LockOrder {
    /// Unique order value for this lock (1-5).
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Conceptual lock level; same-level locks may be acquired in any order.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Collector => 1,
            Self::Handshake | Self::StopTheWorld => 2,
            Self::ThreadList => 3,
            Self::ThreadSelf => 4,
        }
    }
}

/// RAII guard that validates lock acquisition order in debug builds.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Records acquisition of a lock with the given order tag.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lower-level lock is acquired while a
    /// higher-level lock is held.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let current_min = get_min_lock_order();
            validate_lock_order(tag, current_min);
            set_min_lock_order(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                state.stack.borrow_mut().pop();
            }
        });
    }
}

/// Disables lock order tracking for the current thread during teardown,
/// before its thread-local storage is destroyed.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            state.is_shutdown.set(true);
        });
    }
}

/// Validates lock acquisition order in debug builds.
///
/// # Panics
///
/// Panics if `tag` is lower-level than `current_min`.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, current_min: LockOrder) {
    let same_level = tag.level() == current_min.level();
    let is_downgrade = tag.level() < current_min.level();

    assert!(
        same_level || !is_downgrade,
        "Lock ordering violation: {:?} (level {}) cannot be acquired while holding {:?} (level {})",
        tag,
        tag.level(),
        current_min,
        current_min.level()
    );
}

#[inline]
#[cfg(not(debug_assertions))]
pub fn validate_lock_order(_tag: LockOrder, _current_min: LockOrder) {
    // No-op in release builds
}

#[inline]
#[cfg(debug_assertions)]
fn set_min_lock_order(order: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if state.is_shutdown.get() {
            return;
        }
        state.stack.borrow_mut().push(order.level());
    });
}

/// The lowest lock level currently held by this thread, defaulting to
/// `Collector` (level 1) when nothing is held.
#[inline]
#[cfg(debug_assertions)]
#[must_use]
pub fn get_min_lock_order() -> LockOrder {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return LockOrder::Collector;
            }
            let stack = state.stack.borrow();
            let min_level = stack.iter().copied().min().unwrap_or(1);
            match min_level {
                2 => LockOrder::Handshake,
                3 => LockOrder::ThreadList,
                4 => LockOrder::ThreadSelf,
                _ => LockOrder::Collector,
            }
        })
        .unwrap_or(LockOrder::Collector)
}
