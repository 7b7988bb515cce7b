//! Global-variable slots and coalesced first-touch initialization.
//!
//! A [`GlobalCell`] is a static capability slot for one global variable.
//! Initializers run inside an [`InitializationContext`]: a refcounted
//! record, created on demand and shared across nested initializer calls,
//! that accumulates (slot, object) pairs and commits them - publishing the
//! capabilities into the slots behind a store-store fence - exactly when
//! its reference count returns to zero. The whole affair runs under the
//! global initialization lock, so concurrent first-touch of the same
//! global has exactly one winner and both threads observe the identical
//! object afterwards.

use parking_lot::lock_api::RawMutex as _;
use parking_lot::Mutex;
use std::sync::atomic::{fence, Ordering};

use crate::object::{CapWord, ObjectRef, FLAG_GLOBAL};
use crate::ptr::CapPtr;
use crate::runtime::runtime;
use crate::thread::Thread;

/// The global initialization lock. Raw because it is locked by the
/// outermost context creation and unlocked by the matching commit.
static GLOBAL_INIT_LOCK: parking_lot::RawMutex = parking_lot::RawMutex::INIT;

/// A static capability slot holding one global variable's capability.
///
/// Starts all-null; the initialization machinery publishes into it once.
pub struct GlobalCell {
    word: CapWord,
}

impl GlobalCell {
    /// An uninitialized cell, usable in a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: CapWord::zeroed(),
        }
    }

    /// The published capability, or all-null before initialization.
    #[must_use]
    pub fn load(&self) -> CapPtr {
        self.word.load()
    }

    fn publish(&self, cap: CapPtr) {
        // Pre-publication store: the commit fence ordered the object's
        // contents before this, and no barrier is needed for a store the
        // collector discovers only through the global roots list.
        self.word.store(cap);
    }
}

impl Default for GlobalCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of initialized global-variable objects; a GC root.
///
/// Globals are immortal but carry outgoing pointers, so the collector
/// rescans them every cycle.
pub struct GlobalRoots {
    list: Mutex<Vec<ObjectRef>>,
}

impl GlobalRoots {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, object: ObjectRef) {
        self.list.lock().push(object);
    }

    pub(crate) fn for_each_root(&self, mut each: impl FnMut(ObjectRef)) {
        for object in self.list.lock().iter() {
            each(*object);
        }
    }

    /// Number of registered global objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Whether no globals have been initialized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

/// A per-translation-unit initialization record.
///
/// Lives entirely under the global initialization lock; nested initializer
/// calls share the same context via the refcount.
pub struct InitializationContext {
    ref_count: usize,
    pending: Vec<(&'static GlobalCell, ObjectRef)>,
}

impl InitializationContext {
    fn new() -> Self {
        Self {
            ref_count: 1,
            pending: Vec::new(),
        }
    }

    /// Joins a nested initializer call to this context.
    pub fn enter_nested(&mut self) {
        self.ref_count += 1;
    }

    /// Leaves a nested initializer call; returns whether this was the
    /// outermost leave (commit time).
    pub fn leave_nested(&mut self) -> bool {
        debug_assert!(self.ref_count > 0);
        self.ref_count -= 1;
        self.ref_count == 0
    }

    /// Registers `object` as the value for `cell`.
    ///
    /// Returns `false` when the slot turns out to be initialized already -
    /// the losing side of the create race, where another thread ran the
    /// whole initializer between our fast-path check and taking the lock -
    /// or when this context has already seen the slot.
    pub fn add(&mut self, cell: &'static GlobalCell, object: ObjectRef) -> bool {
        debug_assert!(object.has_flags(FLAG_GLOBAL));
        let current = cell.load();
        if !current.is_totally_null() {
            debug_assert_eq!(current.object(), Some(object));
            return false;
        }
        if self
            .pending
            .iter()
            .any(|(pending_cell, _)| std::ptr::eq(*pending_cell, cell))
        {
            return false;
        }
        runtime().globals.push(object);
        self.pending.push((cell, object));
        true
    }

    /// Nested initialization for use inside an initializer body.
    ///
    /// The global initialization lock is already held and is not reentrant,
    /// so an initializer that touches another uninitialized global must go
    /// through its context rather than back through
    /// [`initialize_global`]. Joins this context (refcount up, refcount
    /// down) and resolves the cell against both the committed state and the
    /// pending set.
    pub fn get_or_initialize(
        &mut self,
        thread: &Thread,
        cell: &'static GlobalCell,
        init: impl FnOnce(&Thread, &mut Self) -> ObjectRef,
    ) -> CapPtr {
        let current = cell.load();
        if !current.is_totally_null() {
            return current;
        }
        if let Some(&(_, object)) = self
            .pending
            .iter()
            .find(|(pending_cell, _)| std::ptr::eq(*pending_cell, cell))
        {
            return CapPtr::from_object(object);
        }
        self.enter_nested();
        let object = init(thread, self);
        let outermost = self.leave_nested();
        debug_assert!(!outermost);
        let added = self.add(cell, object);
        debug_assert!(added);
        CapPtr::from_object(object)
    }

    /// Publishes every pending slot. Runs exactly once, when the refcount
    /// reaches zero.
    fn commit(self) {
        fence(Ordering::Release);
        for (cell, object) in self.pending {
            debug_assert!(cell.load().is_totally_null());
            cell.publish(CapPtr::from_object(object));
        }
    }
}

/// Runs `body` inside a fresh outermost initialization context, committing
/// it on the way out. Nested global initialization reuses the same context
/// through the `&mut` it receives.
pub fn with_initialization_context<R>(body: impl FnOnce(&mut InitializationContext) -> R) -> R {
    GLOBAL_INIT_LOCK.lock();
    let mut context = InitializationContext::new();
    let result = body(&mut context);
    let commit_now = context.leave_nested();
    debug_assert!(commit_now);
    context.commit();
    // SAFETY: Locked above in this same function.
    unsafe { GLOBAL_INIT_LOCK.unlock() };
    result
}

/// Lazily initializes the global behind `cell`.
///
/// The fast path is a single slot load. On first touch, `init` runs under
/// the global initialization lock; when two threads race, exactly one
/// initializer's side effects win and both observe the identical object.
pub fn initialize_global(
    thread: &Thread,
    cell: &'static GlobalCell,
    init: impl FnOnce(&Thread, &mut InitializationContext) -> ObjectRef,
) -> CapPtr {
    let cached = cell.load();
    if !cached.is_totally_null() {
        return cached;
    }
    with_initialization_context(|context| {
        let current = cell.load();
        if !current.is_totally_null() {
            // Lost the race; the winner already committed.
            return current;
        }
        let object = init(thread, context);
        let added = context.add(cell, object);
        debug_assert!(added);
        CapPtr::from_object(object)
    })
}
