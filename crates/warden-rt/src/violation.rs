//! Safety-violation taxonomy and the fatal trap path.
//!
//! Every check in the runtime reports failure as a [`Violation`] carrying the
//! kind and a formatted message. A violation is not an exception: the only
//! thing to do with one at a public entry point is [`Violation::trap`], which
//! dumps the current thread's logical frame stack and terminates the process.
//! Ordinary OS-level failures (`ENOENT`, `EINTR`, ...) are `std::io::Error`
//! values and never come anywhere near this module.
//!
//! Under the `test-util` feature (or `cfg(test)`) the trap panics with the
//! formatted message instead of aborting, so tests can observe the exact
//! failure condition with `#[should_panic(expected = ...)]`.

use std::fmt;

/// The kind of safety violation.
///
/// User-caused violations (`Access`, `Type`, `Lifecycle`) and runtime-bug
/// assertions (`RuntimeBug`) are logged with distinct prefixes so the two are
/// triageable separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Null object, out-of-bounds address, insufficient remaining bytes, or
    /// a write to read-only memory.
    Access,
    /// Word-type mismatch: int access to a concretely pointer-typed word or
    /// vice versa, or a copy across incompatible concrete types.
    Type,
    /// An operation forbidden for the object's lifecycle class: freeing a
    /// special/global/mmap object, double free, pinned free, stale
    /// continuation resume.
    Lifecycle,
    /// An invariant that is unreachable if the runtime itself is correct,
    /// e.g. a non-empty mark stack at the start of a sweep.
    RuntimeBug,
}

impl ViolationKind {
    /// The diagnostic prefix printed before the message.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Access => "access violation",
            Self::Type => "type violation",
            Self::Lifecycle => "lifecycle violation",
            Self::RuntimeBug => "runtime bug",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A failed safety check.
///
/// The message is formatted eagerly at the failure site; that is fine because
/// constructing a `Violation` is already the end of the line for the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    kind: ViolationKind,
    message: String,
}

impl Violation {
    /// Creates a violation of the given kind.
    #[must_use]
    pub const fn new(kind: ViolationKind, message: String) -> Self {
        Self { kind, message }
    }

    /// The violation kind.
    #[must_use]
    pub const fn kind(&self) -> ViolationKind {
        self.kind
    }

    /// The formatted failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Dumps the diagnostic and the current thread's frame trace to stderr,
    /// then terminates the process.
    ///
    /// There is no unwinding recovery path for safety violations; callers
    /// cannot intercept this other than by not triggering it.
    pub fn trap(self) -> ! {
        eprintln!("warden: {}: {}", self.kind, self.message);
        crate::frame::dump_current_frames_to_stderr();
        #[cfg(feature = "tracing")]
        tracing::error!(kind = %self.kind, message = %self.message, "fatal safety violation");
        die(&format!("{}: {}", self.kind, self.message))
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Violation {}

#[cfg(any(test, feature = "test-util"))]
fn die(message: &str) -> ! {
    panic!("{message}");
}

#[cfg(not(any(test, feature = "test-util")))]
fn die(_message: &str) -> ! {
    std::process::abort();
}

/// Unwraps a check result, trapping on violation.
///
/// This is the seam the instrumented-code entry points use: internal checks
/// return `Result` so the test suite can inspect the failure, and the public
/// wrappers collapse `Err` into the fatal path.
#[inline]
pub fn or_trap<T>(result: Result<T, Violation>) -> T {
    match result {
        Ok(value) => value,
        Err(violation) => violation.trap(),
    }
}

/// Fails with the given violation kind unless `cond` holds.
///
/// The message arguments are only evaluated on failure.
macro_rules! ensure {
    ($cond:expr, $kind:ident, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::violation::Violation::new(
                $crate::violation::ViolationKind::$kind,
                format!($($arg)*),
            ));
        }
    };
}

pub(crate) use ensure;

#[cfg(test)]
mod tests {
    use super::{Violation, ViolationKind};

    #[test]
    fn test_prefixes_are_distinct() {
        let kinds = [
            ViolationKind::Access,
            ViolationKind::Type,
            ViolationKind::Lifecycle,
            ViolationKind::RuntimeBug,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.prefix(), b.prefix());
            }
        }
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let v = Violation::new(ViolationKind::Access, "ptr >= upper".to_string());
        assert_eq!(v.to_string(), "access violation: ptr >= upper");
    }

    #[test]
    #[should_panic(expected = "type violation: bad word")]
    fn test_trap_panics_under_test() {
        Violation::new(ViolationKind::Type, "bad word".to_string()).trap();
    }
}
