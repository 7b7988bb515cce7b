//! Mark stacks, the global worklist, and the store barrier.
//!
//! Each mutator thread owns a [`MarkStack`]: a thread-local buffer of
//! objects discovered via its roots or its store barrier, later donated to
//! the global worklist that the collector drains. Deduplication happens at
//! push time through the object mark bit, so an object enters a stack at
//! most once per cycle.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use crate::object::{ObjectRef, FLAG_RETURN_BUFFER};
use crate::thread::Thread;

/// Whether a collection cycle is in progress (from the first root handshake
/// until the end of sweep). The allocator consults this to allocate black.
static MARKING: AtomicBool = AtomicBool::new(false);

/// The global mark worklist. Thread mark stacks are donated here; the
/// collector drains it.
static WORKLIST: LazyLock<SegQueue<ObjectRef>> = LazyLock::new(SegQueue::new);

/// Whether a collection cycle is currently active.
#[inline]
#[must_use]
pub fn is_marking() -> bool {
    MARKING.load(Ordering::Relaxed)
}

pub(crate) fn set_marking(active: bool) {
    MARKING.store(active, Ordering::SeqCst);
}

/// A buffer of objects waiting to be scanned.
///
/// Must be empty at the start of the owning thread's sweep contribution; a
/// non-empty stack at that point is a collector bug.
#[derive(Default)]
pub struct MarkStack {
    objects: Vec<ObjectRef>,
}

impl MarkStack {
    /// Creates an empty mark stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Marks `object` and pushes it for scanning if it was not already
    /// marked this cycle.
    pub fn mark(&mut self, object: ObjectRef) {
        if !object.test_and_set_marked() {
            self.objects.push(object);
        }
    }

    /// Marks the object behind an optional reference.
    pub fn mark_opt(&mut self, object: Option<ObjectRef>) {
        if let Some(object) = object {
            self.mark(object);
        }
    }

    /// Pushes without touching the mark bit. Used for global variable
    /// objects, which are roots that must be scanned every cycle.
    pub fn push_for_scan(&mut self, object: ObjectRef) {
        self.objects.push(object);
    }

    /// Pops the next object to scan.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.objects.pop()
    }

    /// Number of buffered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Renders the buffered objects for the sweep-time fatal diagnostic.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        self.objects.iter().map(|object| object.dump()).collect()
    }

    /// Moves every buffered object to the global worklist.
    pub fn donate(&mut self) {
        for object in self.objects.drain(..) {
            WORKLIST.push(object);
        }
    }
}

/// Pops one object from the global worklist.
pub(crate) fn pop_worklist() -> Option<ObjectRef> {
    WORKLIST.pop()
}

/// Whether the global worklist is empty.
pub(crate) fn worklist_is_empty() -> bool {
    WORKLIST.is_empty()
}

/// The collector's store barrier.
///
/// Whenever a pointer-typed word is overwritten with a reference to
/// `target` while the mutator's cycle flag is up, `target` is pushed onto
/// that thread's mark stack - unless it is a return buffer, which is
/// transient and never scanned.
#[inline]
pub fn store_barrier(thread: &Thread, target: Option<ObjectRef>) {
    let Some(target) = target else {
        return;
    };
    if !thread.in_marking() {
        return;
    }
    if target.has_flags(FLAG_RETURN_BUFFER) {
        return;
    }
    thread.with_mark_stack(|stack| stack.mark(target));
}
