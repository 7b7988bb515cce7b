//! The concurrent tracing collector.
//!
//! Split into the cycle driver ([`collector`]), the mark-stack and barrier
//! plumbing ([`mark`]), and the debug lock-ordering discipline
//! ([`lock_order`]).

pub mod collector;
pub mod lock_order;
pub mod mark;

pub use collector::Collector;
#[cfg(any(test, feature = "test-util"))]
pub use collector::{clear_test_roots, register_test_root};
pub use mark::{is_marking, store_barrier, MarkStack};
