//! Thread coordination: enter/exit, soft handshakes, stop-the-world, signal
//! deferral, and fork.
//!
//! Every runtime thread carries a one-byte state machine combining four
//! independent bits: `ENTERED` (executing instrumented code, a valid GC
//! participant subject to pollchecks), `STOP_REQUESTED`, `CHECK_REQUESTED`
//! (a pending soft-handshake callback), and `DEFERRED_SIGNAL`. All
//! transitions are CAS retry loops on the state byte; stop-the-world, soft
//! handshakes, and signal delivery never race each other on a given thread
//! because they all funnel through it.
//!
//! A thread brackets every blocking operation with [`Thread::exit`] /
//! [`Thread::enter`]. [`Thread::pollcheck`] is exit-then-enter, which is
//! correct precisely because exit and enter already fully handle pending
//! stop, handshake, and deferred-signal work.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::frame::FrameStack;
use crate::gc::lock_order::{LockGuard, LockOrder};
use crate::gc::MarkStack;
use crate::object::{ObjectRef, WordType};
use crate::ptr::CapPtr;
use crate::runtime::runtime;
use crate::violation::{or_trap, Violation, ViolationKind};

/// Thread is executing instrumented code and will reach safe points.
pub const STATE_ENTERED: u8 = 1 << 0;
/// A stop-the-world is pending; the thread must not (re-)enter.
pub const STATE_STOP_REQUESTED: u8 = 1 << 1;
/// A soft-handshake callback is pending for this thread.
pub const STATE_CHECK_REQUESTED: u8 = 1 << 2;
/// One or more signals arrived while delivery was unsafe.
pub const STATE_DEFERRED_SIGNAL: u8 = 1 << 3;

/// Largest signal number tracked by the deferral machinery.
pub const MAX_SIGNUM: usize = 64;

/// A user signal handler, invoked once per deferred occurrence.
pub type SignalHandlerFn = fn(i32);

/// A soft-handshake callback. Runs exactly once per live thread, either on
/// the thread itself (at its next safe point) or on the requester's thread
/// if the target is currently exited.
pub type HandshakeCallback = Arc<dyn Fn(&Thread) + Send + Sync>;

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Thread>>> =
        const { std::cell::RefCell::new(None) };
}

// ============================================================================
// Thread
// ============================================================================

/// A runtime-visible thread.
///
/// Created on spawn/attach, wrapped in a one-word `Thread` special object,
/// and destroyed only after the OS thread has stopped and no thread-list
/// references remain (the `Arc` makes that ordering structural).
pub struct Thread {
    tid: u32,
    state: AtomicU8,
    /// Guards the pollcheck callback slot; pairs with `cond`.
    sync: Mutex<Option<HandshakeCallback>>,
    cond: Condvar,
    frames: Mutex<FrameStack>,
    mark_stack: Mutex<MarkStack>,
    /// Objects allocated but not yet linked anywhere scannable. Their mark
    /// bit is forced on without scanning their (not-yet-valid) contents.
    allocation_roots: Mutex<Vec<ObjectRef>>,
    /// Per-thread cycle flag raised and lowered by handshakes; gates the
    /// store barrier.
    in_marking: AtomicBool,
    /// Fixed per-thread capability fields: spawn argument and result.
    arg: Mutex<CapPtr>,
    result: Mutex<CapPtr>,
    deferred_signals: [AtomicU32; MAX_SIGNUM + 1],
    special_deferral_depth: AtomicU32,
    bytes_since_pollcheck: AtomicUsize,
    has_started: AtomicBool,
    forked: AtomicBool,
    object: OnceLock<ObjectRef>,
}

impl Thread {
    fn new(tid: u32) -> Self {
        Self {
            tid,
            state: AtomicU8::new(0),
            sync: Mutex::new(None),
            cond: Condvar::new(),
            frames: Mutex::new(FrameStack::default()),
            mark_stack: Mutex::new(MarkStack::new()),
            allocation_roots: Mutex::new(Vec::new()),
            in_marking: AtomicBool::new(false),
            arg: Mutex::new(CapPtr::forge_null()),
            result: Mutex::new(CapPtr::forge_null()),
            deferred_signals: std::array::from_fn(|_| AtomicU32::new(0)),
            special_deferral_depth: AtomicU32::new(0),
            bytes_since_pollcheck: AtomicUsize::new(0),
            has_started: AtomicBool::new(false),
            forked: AtomicBool::new(false),
            object: OnceLock::new(),
        }
    }

    /// The thread's small recycled id, unique among live threads.
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// The current thread's runtime registration, if any.
    #[must_use]
    pub fn try_current() -> Option<Arc<Self>> {
        CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
    }

    /// The current thread's runtime registration.
    ///
    /// # Panics
    ///
    /// Panics if the calling OS thread was never attached.
    #[must_use]
    pub fn current() -> Arc<Self> {
        Self::try_current().expect("calling thread is not attached to the runtime")
    }

    /// Attaches the calling OS thread if needed and returns its
    /// registration. Test helper.
    #[must_use]
    pub fn attach_or_current() -> Arc<Self> {
        Self::try_current().map_or_else(attach_current, |thread| thread)
    }

    /// The `Thread` special object wrapping this thread.
    #[must_use]
    pub fn object(&self) -> ObjectRef {
        *self.object.get().expect("thread object not yet created")
    }

    /// A capability to the `Thread` special object.
    #[must_use]
    pub fn as_cap(&self) -> CapPtr {
        CapPtr::from_object(self.object())
    }

    #[inline]
    fn load_state(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }

    /// Whether the thread currently holds the `ENTERED` bit.
    #[must_use]
    pub fn is_entered(&self) -> bool {
        self.load_state() & STATE_ENTERED != 0
    }

    /// Whether the thread died in a parent process (exists only as a forked
    /// husk in this one). Joining it fails with `ESRCH`.
    #[must_use]
    pub fn is_forked(&self) -> bool {
        self.forked.load(Ordering::Relaxed)
    }

    fn participates_in_handshakes(&self) -> bool {
        self.has_started.load(Ordering::Relaxed) && !self.is_forked()
    }

    #[inline]
    pub(crate) fn in_marking(&self) -> bool {
        self.in_marking.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_marking(&self, active: bool) {
        self.in_marking.store(active, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Enter / exit / pollcheck
    // ------------------------------------------------------------------

    /// Transitions from exited to `ENTERED`.
    ///
    /// If a stop or handshake check is pending, the thread first services
    /// its own pending callback (a thread may always run its own callback
    /// immediately) and waits out any stop request before winning the
    /// `ENTERED` bit by CAS. This closes the window where a thread reenters
    /// concurrently with the very stop or handshake that targets it.
    pub fn enter(&self) {
        debug_assert!(!self.is_entered());
        loop {
            let old = self.load_state();
            debug_assert!(old & STATE_ENTERED == 0);
            debug_assert!(old & STATE_DEFERRED_SIGNAL == 0);
            if old & (STATE_CHECK_REQUESTED | STATE_STOP_REQUESTED) != 0 {
                let _blocked = SignalBlockGuard::block_all();
                let _order = LockGuard::new(LockOrder::ThreadSelf);
                let mut sync = self.sync.lock();
                self.service_own_callback(&mut sync);
                while self.load_state() & STATE_STOP_REQUESTED != 0 {
                    debug_assert!(!self.is_entered());
                    self.cond.wait(&mut sync);
                }
                continue;
            }
            if self
                .state
                .compare_exchange_weak(old, old | STATE_ENTERED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        debug_assert!(self.is_entered());
    }

    /// Transitions from `ENTERED` to exited.
    ///
    /// Exit is a small state machine, not a single bit flip: any deferred
    /// signals are replayed and any pending handshake callback is serviced
    /// first, because either may land exactly while the thread is on its
    /// way out. Retried via CAS until the state is clean.
    pub fn exit(&self) {
        debug_assert!(self.is_entered());
        loop {
            let old = self.load_state();
            debug_assert!(old & STATE_ENTERED != 0);
            if old & STATE_DEFERRED_SIGNAL != 0 {
                self.handle_deferred_signals();
                continue;
            }
            if old & STATE_CHECK_REQUESTED != 0 {
                let _order = LockGuard::new(LockOrder::ThreadSelf);
                let mut sync = self.sync.lock();
                self.service_own_callback(&mut sync);
                continue;
            }
            if self
                .state
                .compare_exchange_weak(old, old & !STATE_ENTERED, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        debug_assert!(!self.is_entered());
        if self.load_state() & STATE_STOP_REQUESTED != 0 {
            // A stopper may be waiting on our condvar for the ENTERED bit to
            // fall; wake it.
            let _order = LockGuard::new(LockOrder::ThreadSelf);
            let _sync = self.sync.lock();
            self.cond.notify_all();
        }
    }

    /// A cheap cooperative safe point for long-running managed code.
    ///
    /// Returns `true` if the slow path ran (some pending work existed).
    pub fn pollcheck(&self) -> bool {
        debug_assert!(self.is_entered());
        self.bytes_since_pollcheck.store(0, Ordering::Relaxed);
        if self.load_state() & (STATE_STOP_REQUESTED | STATE_CHECK_REQUESTED | STATE_DEFERRED_SIGNAL)
            == 0
        {
            return false;
        }
        self.exit();
        self.enter();
        true
    }

    /// Allocation accounting: after roughly `MAX_BYTES_BETWEEN_POLLCHECKS`
    /// of allocation the thread offers a safe point.
    pub(crate) fn note_allocation(&self, bytes: usize) {
        let total = self
            .bytes_since_pollcheck
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        if total > crate::heap::MAX_BYTES_BETWEEN_POLLCHECKS && self.is_entered() {
            self.pollcheck();
        }
    }

    /// Exits after declaring `object` an allocation root: the object is mid
    /// construction and must be neither scanned nor collected while the
    /// thread is outside the safety envelope.
    pub fn exit_with_allocation_root(&self, object: ObjectRef) {
        self.allocation_roots.lock().push(object);
        self.exit();
    }

    /// Re-enters and withdraws the allocation-root declaration.
    pub fn enter_with_allocation_root(&self, object: ObjectRef) {
        self.enter();
        let mut roots = self.allocation_roots.lock();
        if let Some(position) = roots.iter().position(|o| *o == object) {
            roots.swap_remove(position);
        }
    }

    /// RAII enter: enters now, exits when the guard drops.
    #[must_use]
    pub fn enter_guard(&self) -> EnterGuard<'_> {
        self.enter();
        EnterGuard(self)
    }

    /// Runs the pending handshake callback, if any, with `sync` held.
    fn service_own_callback(&self, sync: &mut Option<HandshakeCallback>) {
        if self.load_state() & STATE_CHECK_REQUESTED == 0 {
            return;
        }
        let callback = sync.take().expect("CHECK_REQUESTED without a callback");
        callback(self);
        loop {
            let old = self.load_state();
            debug_assert!(old & STATE_CHECK_REQUESTED != 0);
            if self
                .state
                .compare_exchange_weak(
                    old,
                    old & !STATE_CHECK_REQUESTED,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
        self.cond.notify_all();
    }

    /// Attempts to run the target thread's pending callback from the
    /// handshake requester. Returns whether the callback is no longer
    /// pending (run here, run by the thread itself, or never set).
    fn service_callback_from_handshake(&self, sync: &mut Option<HandshakeCallback>) -> bool {
        if self.load_state() & STATE_CHECK_REQUESTED == 0 {
            return true;
        }
        if self.load_state() & STATE_ENTERED != 0 {
            // The thread is running managed code; it must come to us.
            return false;
        }
        self.service_own_callback(sync);
        true
    }

    // ------------------------------------------------------------------
    // Frames and roots
    // ------------------------------------------------------------------

    /// Runs `f` with the thread's frame state locked.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut FrameStack) -> R) -> R {
        f(&mut self.frames.lock())
    }

    /// Runs `f` with the thread's mark stack locked.
    pub(crate) fn with_mark_stack<R>(&self, f: impl FnOnce(&mut MarkStack) -> R) -> R {
        f(&mut self.mark_stack.lock())
    }

    /// Renders the logical frame trace, innermost first.
    #[must_use]
    pub fn dump_frames(&self) -> Vec<String> {
        self.frames.lock().dump()
    }

    /// Marks this thread's roots into its own mark stack.
    pub(crate) fn mark_roots(&self) {
        for object in self.allocation_roots.lock().iter() {
            // Force the mark bit without scanning the not-yet-valid payload.
            let _ = object.test_and_set_marked();
        }
        let mut stack = self.mark_stack.lock();
        self.frames.lock().for_each_root(|object| stack.mark(object));
        stack.mark_opt(self.arg.lock().object());
        stack.mark_opt(self.result.lock().object());
    }

    /// Marks the objects reachable from the thread's fixed capability
    /// fields. Used when the collector scans the `Thread` special object.
    pub(crate) fn mark_outgoing(&self, stack: &mut MarkStack) {
        stack.mark_opt(self.arg.lock().object());
        stack.mark_opt(self.result.lock().object());
    }

    /// Donates the thread's mark stack to the global worklist.
    pub(crate) fn donate_mark_stack(&self) {
        self.mark_stack.lock().donate();
    }

    /// Asserts the mark stack is empty at the start of the thread's sweep
    /// contribution. A non-empty stack here is a collector bug and fatal.
    pub(crate) fn verify_sweep_mark_stack(&self) {
        let stack = self.mark_stack.lock();
        if !stack.is_empty() {
            for line in stack.dump() {
                eprintln!("warden:    leftover mark: {line}");
            }
            drop(stack);
            or_trap::<()>(Err(Violation::new(
                ViolationKind::RuntimeBug,
                format!(
                    "non-empty mark stack on thread {} at start of sweep",
                    self.tid
                ),
            )));
        }
    }

    /// The spawn-argument capability slot.
    pub fn set_arg(&self, cap: CapPtr) {
        *self.arg.lock() = cap;
    }

    /// The result capability slot.
    pub fn set_result(&self, cap: CapPtr) {
        *self.result.lock() = cap;
    }

    /// Reads the result capability slot.
    #[must_use]
    pub fn result(&self) -> CapPtr {
        *self.result.lock()
    }

    // ------------------------------------------------------------------
    // Signal deferral
    // ------------------------------------------------------------------

    /// Records a signal that cannot be delivered right now. Called from the
    /// signal trampoline.
    pub(crate) fn defer_signal(&self, signum: usize) {
        debug_assert!(signum <= MAX_SIGNUM);
        self.deferred_signals[signum].fetch_add(1, Ordering::Relaxed);
        self.state.fetch_or(STATE_DEFERRED_SIGNAL, Ordering::Relaxed);
    }

    /// Replays every deferred signal, in signal-number order, invoking the
    /// handler once per deferred occurrence. Runs with the thread entered.
    fn handle_deferred_signals(&self) {
        debug_assert!(self.is_entered());
        loop {
            let old = self.load_state();
            if old & STATE_DEFERRED_SIGNAL == 0 {
                return;
            }
            if self
                .state
                .compare_exchange_weak(
                    old,
                    old & !STATE_DEFERRED_SIGNAL,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
        for signum in 0..=MAX_SIGNUM {
            loop {
                let pending = self.deferred_signals[signum].load(Ordering::Relaxed);
                if pending == 0 {
                    break;
                }
                if self.deferred_signals[signum]
                    .compare_exchange_weak(pending, pending - 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                runtime().signals.deliver(i32::try_from(signum).expect("signum fits"));
            }
        }
    }

    /// Enters a scope in which signal delivery must be deferred even though
    /// the thread is otherwise at a deliverable point.
    pub fn increase_special_signal_deferral_depth(&self) {
        self.special_deferral_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Leaves a special deferral scope, re-arming the deferred-signal bit if
    /// occurrences accumulated inside the scope.
    pub fn decrease_special_signal_deferral_depth(&self) {
        let old = self.special_deferral_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0);
        if old == 1
            && self
                .deferred_signals
                .iter()
                .any(|count| count.load(Ordering::Relaxed) > 0)
        {
            self.state.fetch_or(STATE_DEFERRED_SIGNAL, Ordering::Relaxed);
        }
    }

    pub(crate) fn special_deferral_depth(&self) -> u32 {
        self.special_deferral_depth.load(Ordering::Relaxed)
    }
}

/// RAII wrapper for [`Thread::enter`].
pub struct EnterGuard<'a>(&'a Thread);

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

// ============================================================================
// Signal masking helper
// ============================================================================

/// Blocks all blockable signals for the current thread while alive.
///
/// Coarse subsystem locks are always acquired with signals blocked so a
/// signal handler cannot reenter the lock.
pub(crate) struct SignalBlockGuard {
    old_set: libc::sigset_t,
}

impl SignalBlockGuard {
    pub(crate) fn block_all() -> Self {
        // SAFETY: Plain sigmask manipulation on the current thread.
        unsafe {
            let mut fill: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut fill);
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &fill, &mut old);
            debug_assert_eq!(rc, 0);
            Self { old_set: old }
        }
    }
}

impl Drop for SignalBlockGuard {
    fn drop(&mut self) {
        // SAFETY: Restores the mask saved by block_all on this same thread.
        unsafe {
            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_set, std::ptr::null_mut());
            debug_assert_eq!(rc, 0);
        }
    }
}

// ============================================================================
// Registry: the live thread set
// ============================================================================

struct TidPool {
    next: u32,
    /// FIFO so a freed id is not reused immediately, avoiding ABA confusion
    /// across join/create races.
    free: std::collections::VecDeque<u32>,
}

/// The live thread set plus the handshake and stop-the-world machinery.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<Thread>>>,
    tids: Mutex<TidPool>,
    handshake_lock: Mutex<()>,
    stop_the_world_count: Mutex<u32>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            tids: Mutex::new(TidPool {
                next: 1,
                free: std::collections::VecDeque::new(),
            }),
            handshake_lock: Mutex::new(()),
            stop_the_world_count: Mutex::new(0),
        }
    }

    fn allocate_tid(&self) -> u32 {
        let mut pool = self.tids.lock();
        pool.free.pop_front().unwrap_or_else(|| {
            let tid = pool.next;
            pool.next += 1;
            tid
        })
    }

    fn relinquish_tid(&self, tid: u32) {
        self.tids.lock().free.push_back(tid);
    }

    /// Snapshots the live thread list. The list lock is held only for the
    /// snapshot, never across per-thread work.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Thread>> {
        let _order = LockGuard::new(LockOrder::ThreadList);
        self.threads.lock().clone()
    }

    /// Number of live threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether the registry has no threads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    // ------------------------------------------------------------------
    // Soft handshake
    // ------------------------------------------------------------------

    /// Broadcasts `callback` to every live thread and blocks until each has
    /// executed it exactly once.
    ///
    /// Threads that are exited (blocked in a syscall) have the callback run
    /// on their behalf by the requester; entered threads run it themselves
    /// at their next safe point. Handshakes cannot overlap; a dedicated
    /// lock serializes them.
    pub fn soft_handshake(&self, callback: HandshakeCallback) {
        if let Some(me) = Thread::try_current() {
            debug_assert!(!me.is_entered(), "soft handshake from an entered thread");
        }
        let _order = LockGuard::new(LockOrder::Handshake);
        let handshake = self.handshake_lock.lock();
        let _blocked = SignalBlockGuard::block_all();

        let threads = self.snapshot();

        // Announce as fast as possible, without running anything yet, to
        // maximize the window during which threads know work is pending.
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            let _t_order = LockGuard::new(LockOrder::ThreadSelf);
            let mut sync = thread.sync.lock();
            debug_assert!(sync.is_none());
            *sync = Some(Arc::clone(&callback));
            loop {
                let old = thread.load_state();
                debug_assert!(old & STATE_CHECK_REQUESTED == 0);
                if thread
                    .state
                    .compare_exchange_weak(
                        old,
                        old | STATE_CHECK_REQUESTED,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }

        // Opportunistically run whatever we can ourselves; exited threads
        // are serviced here and entered threads may finish in the meantime.
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            let _t_order = LockGuard::new(LockOrder::ThreadSelf);
            let mut sync = thread.sync.lock();
            let _ = thread.service_callback_from_handshake(&mut sync);
        }

        // Now actually wait for every thread to have run it.
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            let _t_order = LockGuard::new(LockOrder::ThreadSelf);
            let mut sync = thread.sync.lock();
            while !thread.service_callback_from_handshake(&mut sync) {
                thread.cond.wait(&mut sync);
            }
        }

        drop(handshake);
    }

    // ------------------------------------------------------------------
    // Stop the world
    // ------------------------------------------------------------------

    /// Requests that no thread be `ENTERED` until the matching
    /// [`ThreadRegistry::resume_the_world`]. Reference-counted; nested calls
    /// are cheap no-ops beyond the outer pair.
    ///
    /// A thread is not forced to stop mid-flight: it "stops" by never
    /// re-entering while the bit is set.
    pub fn stop_the_world(&self) {
        let _order = LockGuard::new(LockOrder::StopTheWorld);
        let mut count = self.stop_the_world_count.lock();
        *count += 1;
        if *count > 1 {
            return;
        }
        let _blocked = SignalBlockGuard::block_all();
        let threads = self.snapshot();
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            loop {
                let old = thread.load_state();
                debug_assert!(old & STATE_STOP_REQUESTED == 0);
                if thread
                    .state
                    .compare_exchange_weak(
                        old,
                        old | STATE_STOP_REQUESTED,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }
        let me = Thread::try_current();
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            if let Some(me) = &me {
                if Arc::ptr_eq(me, thread) {
                    debug_assert!(!thread.is_entered());
                    continue;
                }
            }
            let _t_order = LockGuard::new(LockOrder::ThreadSelf);
            let mut sync = thread.sync.lock();
            while thread.is_entered() {
                thread.cond.wait(&mut sync);
            }
        }
    }

    /// Releases one stop-the-world request; the outermost release clears the
    /// stop bits and wakes every parked thread.
    pub fn resume_the_world(&self) {
        let _order = LockGuard::new(LockOrder::StopTheWorld);
        let mut count = self.stop_the_world_count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count > 0 {
            return;
        }
        let threads = self.snapshot();
        for thread in &threads {
            if !thread.participates_in_handshakes() {
                continue;
            }
            loop {
                let old = thread.load_state();
                debug_assert!(old & STATE_STOP_REQUESTED != 0);
                if thread
                    .state
                    .compare_exchange_weak(
                        old,
                        old & !STATE_STOP_REQUESTED,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            }
            let _t_order = LockGuard::new(LockOrder::ThreadSelf);
            let _sync = thread.sync.lock();
            thread.cond.notify_all();
        }
    }

    fn reset_after_fork(&self, survivor: &Arc<Thread>) {
        let mut threads = self.threads.lock();
        for thread in threads.iter() {
            if !Arc::ptr_eq(thread, survivor) {
                thread.forked.store(true, Ordering::Relaxed);
            }
        }
        threads.retain(|thread| Arc::ptr_eq(thread, survivor));
        *self.stop_the_world_count.lock() = 0;
        survivor.state.store(0, Ordering::Relaxed);
        *survivor.sync.lock() = None;
    }
}

// ============================================================================
// Attach / detach / spawn
// ============================================================================

/// Registers the calling OS thread with the runtime.
///
/// Creates the thread's `Thread` special object, allocates a tid, and adds
/// the thread to the live set. The thread starts exited; bracket managed
/// work with [`Thread::enter`] / [`Thread::exit`].
///
/// # Panics
///
/// Panics if the thread is already attached.
pub fn attach_current() -> Arc<Thread> {
    assert!(
        Thread::try_current().is_none(),
        "thread is already attached"
    );
    let rt = runtime();
    let tid = rt.registry.allocate_tid();
    let thread = Arc::new(Thread::new(tid));
    let object = crate::heap::allocate_special(WordType::Thread, Arc::clone(&thread));
    thread
        .object
        .set(object)
        .unwrap_or_else(|_| unreachable!("thread object set twice"));
    {
        let _order = LockGuard::new(LockOrder::ThreadList);
        let mut threads = rt.registry.threads.lock();
        // Read the cycle flag inside the list critical section: either this
        // thread lands in the collector's root snapshot (whose callback
        // raises the flag), or the snapshot already happened and the global
        // flag is visible here.
        thread.set_in_marking(crate::gc::is_marking());
        threads.push(Arc::clone(&thread));
    }
    thread.has_started.store(true, Ordering::Release);
    CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&thread)));
    thread
}

/// Deregisters the calling OS thread. It must be exited. Removed from the
/// thread list first; the tid is recycled afterwards.
pub fn detach_current() {
    let thread = Thread::current();
    assert!(!thread.is_entered(), "detach of an entered thread");
    let rt = runtime();
    {
        let _order = LockGuard::new(LockOrder::ThreadList);
        rt.registry
            .threads
            .lock()
            .retain(|other| !Arc::ptr_eq(other, &thread));
    }
    rt.registry.relinquish_tid(thread.tid);
    crate::gc::lock_order::enter_thread_shutdown();
    CURRENT.with(|current| *current.borrow_mut() = None);
}

/// Spawns an OS thread registered with the runtime: attaches, enters, runs
/// `body`, exits, detaches.
pub fn spawn_managed<F, T>(body: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce(&Thread) -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::spawn(move || {
        let thread = attach_current();
        thread.enter();
        let result = body(&thread);
        thread.exit();
        detach_current();
        result
    })
}

/// Checks that `thread` is joinable in this process. A thread that died
/// with a forked parent image reports "no such process".
pub fn check_joinable(thread: &Thread) -> io::Result<()> {
    if thread.is_forked() {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    Ok(())
}

// ============================================================================
// Signals
// ============================================================================

struct SignalRecord {
    handler: SignalHandlerFn,
    object: ObjectRef,
}

/// The global signal-handler table; a GC root.
pub struct SignalTable {
    entries: [std::sync::atomic::AtomicPtr<SignalRecord>; MAX_SIGNUM + 1],
}

impl SignalTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| std::sync::atomic::AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Installs `handler` for `signum`, wrapping it in a `SignalHandler`
    /// special object and registering the deferral trampoline with the OS.
    pub fn install(&self, signum: usize, handler: SignalHandlerFn) -> io::Result<()> {
        if signum == 0 || signum > MAX_SIGNUM {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let record = Box::new(SignalRecord {
            handler,
            object: crate::heap::allocate_special(WordType::SignalHandler, handler),
        });
        let record = Box::into_raw(record);
        // A replaced record is leaked deliberately: a concurrently running
        // trampoline may still be reading it, and replacement is rare
        // enough that reclaiming it is not worth a hazard scheme.
        let _replaced = self.entries[signum].swap(record, Ordering::Release);

        // SAFETY: Standard sigaction installation; the trampoline is
        // async-signal-aware (it only touches atomics and the state byte on
        // the deferral path).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = signal_trampoline as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&mut action.sa_mask);
            if libc::sigaction(
                i32::try_from(signum).expect("signum fits"),
                &action,
                std::ptr::null_mut(),
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn record(&self, signum: i32) -> Option<&SignalRecord> {
        let signum = usize::try_from(signum).ok()?;
        if signum > MAX_SIGNUM {
            return None;
        }
        let ptr = self.entries[signum].load(Ordering::Acquire);
        // SAFETY: Records are never freed (see install), so a non-null
        // pointer is always valid.
        unsafe { ptr.as_ref() }
    }

    /// Invokes the installed handler for `signum`, if any.
    pub(crate) fn deliver(&self, signum: i32) {
        if let Some(record) = self.record(signum) {
            (record.handler)(signum);
        }
    }

    /// Marks the handler special objects as global roots.
    pub(crate) fn mark_roots(&self, stack: &mut MarkStack) {
        for entry in &self.entries {
            let ptr = entry.load(Ordering::Acquire);
            // SAFETY: As in record.
            if let Some(record) = unsafe { ptr.as_ref() } {
                stack.mark(record.object);
            }
        }
    }
}

extern "C" fn signal_trampoline(signum: libc::c_int) {
    let Some(thread) = Thread::try_current() else {
        // Unmanaged thread: deliver directly.
        runtime().signals.deliver(signum);
        return;
    };
    let deliverable = !thread.is_entered() && thread.special_deferral_depth() == 0;
    if deliverable {
        // Deliver immediately by synthetically entering around the call.
        thread.enter();
        runtime().signals.deliver(signum);
        thread.exit();
    } else if let Ok(signum) = usize::try_from(signum) {
        thread.defer_signal(signum);
    }
}

// ============================================================================
// Fork
// ============================================================================

/// Outcome of a runtime fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// In the parent; carries the child pid.
    Parent(i32),
    /// In the child process.
    Child,
}

/// Forks the process with the runtime quiescent.
///
/// Suspends the collector, stops the world, and locks the parker and every
/// thread's coordination lock so `fork` duplicates a consistent image. The
/// child prunes its thread list down to the calling thread and marks every
/// other thread forked (dead, never joinable); locks are released and
/// subsystems resumed in reverse order on both sides.
///
/// The calling thread must be exited.
pub fn fork() -> io::Result<ForkOutcome> {
    let me = Thread::current();
    assert!(!me.is_entered(), "fork from an entered thread");
    let rt = runtime();

    let collector_quiesced = rt.collector.quiesce();
    rt.registry.stop_the_world();
    let parker_locked = rt.parker.lock_for_fork();
    let threads = rt.registry.snapshot();
    let mut thread_guards = Vec::with_capacity(threads.len());
    for thread in &threads {
        thread_guards.push(thread.sync.lock());
    }

    // SAFETY: Every runtime lock is held and the world is stopped; the
    // child observes a quiescent image.
    let pid = unsafe { libc::fork() };

    if pid < 0 {
        drop(thread_guards);
        drop(parker_locked);
        rt.registry.resume_the_world();
        drop(collector_quiesced);
        return Err(io::Error::last_os_error());
    }

    drop(thread_guards);
    drop(parker_locked);

    if pid == 0 {
        rt.registry.reset_after_fork(&me);
        drop(collector_quiesced);
        rt.collector.respawn_after_fork();
        Ok(ForkOutcome::Child)
    } else {
        rt.registry.resume_the_world();
        drop(collector_quiesced);
        Ok(ForkOutcome::Parent(pid))
    }
}
