//! A capability-pointer memory-safety runtime with a concurrent
//! mark-sweep collector.
//!
//! `warden-rt` is the runtime half of a memory-safe compilation story:
//! instrumented code represents every pointer as a fat **capability**
//! (object reference + address) and calls into this crate before every
//! load, store, and call. The runtime enforces bounds, per-word type
//! discipline, and object lifecycle, and reclaims memory with a
//! **concurrent tracing collector** instead of trusting manual
//! deallocation - an explicit `free` merely poisons the object.
//!
//! # Architecture
//!
//! - [`object`] / [`ptr`]: the heap object header (bounds, flags, per-word
//!   type tags) and the [`CapPtr`] fat pointer.
//! - [`check`]: the access checks instrumented code calls, with lazy
//!   CAS-based `Unset -> Int/Ptr` word typing.
//! - [`heap`]: allocation, reallocation, poisoning free, special one-word
//!   objects, mmap-backed objects.
//! - [`gc`]: the concurrent mark-sweep cycle, store barrier, and the
//!   free-singleton substitution that keeps stale capabilities trapping
//!   predictably.
//! - [`thread`]: enter/exit around blocking operations, pollchecks, soft
//!   handshakes, stop-the-world, signal deferral, and fork.
//! - [`table`]: bidirectional capability/integer encoding tables.
//! - [`bulk`]: type-aware memset/memmove/memcmp.
//! - [`frame`] / [`global`]: GC-rooted call frames, setjmp continuations,
//!   and coalesced global initialization.
//!
//! # Safety model
//!
//! A failed check is a [`Violation`]; at the instrumented entry points it
//! is fatal (diagnostic + frame trace to stderr, then abort). There is no
//! recovery path for safety violations. Ordinary OS errors are
//! `std::io::Error` values and never fatal.
//!
//! # Quick start
//!
//! ```
//! use warden_rt::{check, heap, thread, CapPtr};
//!
//! let me = thread::Thread::attach_or_current();
//! let _enter = me.enter_guard();
//!
//! let object = heap::allocate(&me, 64);
//! let ptr = CapPtr::from_object(object);
//! check::write_int_bytes(ptr, &[1, 2, 3, 4]).unwrap();
//!
//! let mut bytes = [0u8; 4];
//! check::read_int_bytes(ptr, &mut bytes).unwrap();
//! assert_eq!(bytes, [1, 2, 3, 4]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod bulk;
pub mod check;
pub mod frame;
pub mod gc;
pub mod global;
pub mod heap;
pub mod object;
pub mod parker;
pub mod ptr;
pub mod runtime;
pub mod table;
pub mod thread;
mod tracing;
pub mod violation;

// Re-export the core vocabulary types.
pub use check::AccessKind;
pub use frame::{setjmp, longjmp, Origin};
pub use gc::{is_marking, store_barrier};
pub use global::{initialize_global, GlobalCell};
pub use object::{free_singleton, ObjectRef, WordType, WORD_SIZE};
pub use parker::{ParkResult, Parker};
pub use ptr::CapPtr;
pub use runtime::{initialize, runtime};
pub use thread::{attach_current, detach_current, fork, spawn_managed, ForkOutcome, Thread};
pub use violation::{Violation, ViolationKind};

/// Internal inspection hooks for the test suite.
#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    pub use crate::gc::{clear_test_roots, register_test_root};

    /// The raw header pointer behind an object reference.
    #[must_use]
    pub fn internal_ptr(object: crate::ObjectRef) -> *const u8 {
        object.as_ptr().cast::<u8>()
    }
}
