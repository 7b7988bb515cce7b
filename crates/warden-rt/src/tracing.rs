//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collection cycles and handshakes; otherwise it
//! compiles down to a cycle-id counter.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Stable identifier for one collection cycle, correlating every event
    /// within it. Monotonically increasing from 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CycleId(pub u64);

    static NEXT_CYCLE_ID: AtomicU64 = AtomicU64::new(1);

    /// Generates the next cycle id.
    pub fn next_cycle_id() -> CycleId {
        CycleId(NEXT_CYCLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one full collection cycle.
    pub fn trace_cycle(cycle_id: CycleId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", cycle_id = cycle_id.0).entered()
    }

    /// Span covering one soft handshake.
    #[allow(dead_code)]
    pub fn trace_handshake() -> span::EnteredSpan {
        span!(Level::DEBUG, "soft_handshake").entered()
    }

    /// Logs the sweep outcome.
    #[allow(dead_code)]
    pub fn log_sweep(objects_kept: usize, objects_reclaimed: usize) {
        tracing::debug!(objects_kept, objects_reclaimed, "sweep_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub cycle id when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CycleId(pub u64);

    /// Stub generator when tracing is disabled.
    pub fn next_cycle_id() -> CycleId {
        CycleId(0)
    }
}

pub use internal::{next_cycle_id, CycleId};
