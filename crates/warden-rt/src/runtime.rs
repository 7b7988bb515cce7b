//! The process-wide runtime handle.
//!
//! Global mutable state - the thread registry, the collector, the signal
//! table, the global-roots list, the parking lot - lives in one explicit
//! [`Runtime`] service object rather than scattered statics. Entry points
//! reach it through [`runtime`].
//!
//! Initialization order is load-bearing: the collector and heap services
//! come up on first use of [`runtime`], before any thread registration;
//! thread zero's registration ([`crate::thread::attach_current`]) must
//! precede any thread-accounted allocation. Teardown is process exit -
//! the runtime never unwinds.

use std::sync::OnceLock;

use crate::gc::Collector;
use crate::global::GlobalRoots;
use crate::parker::Parker;
use crate::thread::{SignalTable, ThreadRegistry};

/// The runtime's singleton service objects.
pub struct Runtime {
    /// The live thread set plus handshake and stop-the-world machinery.
    pub registry: ThreadRegistry,
    /// The concurrent tracing collector.
    pub collector: Collector,
    /// Initialized global-variable objects (a GC root).
    pub globals: GlobalRoots,
    /// The signal-handler table (a GC root).
    pub signals: SignalTable,
    /// Address-keyed park/unpark queues.
    pub parker: Parker,
}

impl Runtime {
    fn new() -> Self {
        Self {
            registry: ThreadRegistry::new(),
            collector: Collector::new(),
            globals: GlobalRoots::new(),
            signals: SignalTable::new(),
            parker: Parker::new(),
        }
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime, initialized on first use.
pub fn runtime() -> &'static Runtime {
    static COLLECTOR_STARTED: parking_lot::Once = parking_lot::Once::new();
    let rt = RUNTIME.get_or_init(Runtime::new);
    COLLECTOR_STARTED.call_once(|| rt.collector.spawn_thread());
    rt
}

/// Eagerly initializes the runtime. Equivalent to the first [`runtime`]
/// call; exists so embedders can pay the cost at a chosen moment.
pub fn initialize() {
    let _ = runtime();
}

#[cfg(test)]
mod tests {
    use super::runtime;

    #[test]
    fn test_runtime_is_a_singleton() {
        let a = std::ptr::from_ref(runtime());
        let b = std::ptr::from_ref(runtime());
        assert_eq!(a, b);
    }
}
