//! The access checker.
//!
//! Compiled code reduces every load, store, and call to one of four checks:
//! common (bounds/readonly), int (byte range), ptr (one aligned capability
//! word), or special (exact one-word special kind). The int and ptr checks
//! perform the lazy `Unset -> concrete` type transition with a CAS retry
//! loop: when two threads race to first-touch the same word, the loser's CAS
//! fails, it reloads the tag, and it either agrees with the winner or traps.
//!
//! All checks return `Result` so the test suite can observe the exact
//! failure; the instrumented entry points collapse errors into the fatal
//! trap via [`crate::violation::or_trap`].

use crate::object::{WordType, FLAG_FREE, FLAG_READONLY, FLAG_SPECIAL, WORD_SIZE};
use crate::ptr::CapPtr;
use crate::thread::Thread;
use crate::violation::{ensure, Violation};

/// Whether an access reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Load.
    Read,
    /// Store; additionally rejects read-only objects.
    Write,
}

/// Structural self-check of the capability's object, run in the testing
/// configuration before every access.
#[cfg(any(test, feature = "test-util"))]
pub fn validate_ptr(ptr: CapPtr) -> Result<(), Violation> {
    match ptr.object() {
        Some(object) => object.validate(),
        None => Ok(()),
    }
}

/// No-op outside the testing configuration.
#[cfg(not(any(test, feature = "test-util")))]
#[inline]
pub fn validate_ptr(_ptr: CapPtr) -> Result<(), Violation> {
    Ok(())
}

/// The first check on every access: null object, bounds, remaining bytes,
/// and (for writes) the read-only flag. Subsumes bounds checking.
pub fn check_access_common(ptr: CapPtr, bytes: usize, kind: AccessKind) -> Result<(), Violation> {
    validate_ptr(ptr)?;

    let Some(object) = ptr.object() else {
        return Err(Violation::new(
            crate::violation::ViolationKind::Access,
            format!("cannot access pointer with null object (ptr = {})", ptr.dump()),
        ));
    };

    let addr = ptr.addr();
    let lower = object.lower() as usize;
    let upper = object.upper() as usize;

    ensure!(
        addr >= lower,
        Access,
        "cannot access pointer with ptr < lower (ptr = {})",
        ptr.dump()
    );
    ensure!(
        addr < upper,
        Access,
        "cannot access pointer with ptr >= upper (ptr = {})",
        ptr.dump()
    );
    ensure!(
        bytes <= upper - addr,
        Access,
        "cannot access {} bytes when upper - ptr = {} (ptr = {})",
        bytes,
        upper - addr,
        ptr.dump()
    );
    if kind == AccessKind::Write {
        ensure!(
            !object.has_flags(FLAG_READONLY),
            Access,
            "cannot write to read-only object (ptr = {})",
            ptr.dump()
        );
    }
    Ok(())
}

/// Requires the object to be neither free nor special. Used before raw
/// payload access that bypasses the per-word tags (bulk zero-fill, typed
/// word copy).
pub(crate) fn check_accessible(ptr: CapPtr) -> Result<(), Violation> {
    let object = ptr.object().expect("check_accessible after common check");
    ensure!(
        !object.has_flags(FLAG_FREE),
        Access,
        "cannot access pointer to free object (ptr = {})",
        ptr.dump()
    );
    ensure!(
        !object.has_flags(FLAG_SPECIAL),
        Access,
        "cannot access pointer to special object (ptr = {})",
        ptr.dump()
    );
    Ok(())
}

/// Lazily types every word intersecting `[addr, addr + bytes)` as `Int`.
///
/// Assumes the common check already passed; `bytes` must be nonzero.
pub(crate) fn check_int_words(ptr: CapPtr, bytes: usize) -> Result<(), Violation> {
    let object = ptr.object().expect("check_int_words after common check");
    let offset = ptr.addr() - object.lower() as usize;
    let first = offset / WORD_SIZE;
    let last = (offset + bytes - 1) / WORD_SIZE;

    for index in first..=last {
        loop {
            let word_type = object.word_type(index);
            match word_type {
                WordType::Unset => {
                    if object.cas_word_type(index, WordType::Unset, WordType::Int).is_ok() {
                        break;
                    }
                    // Lost the first-touch race; reload and re-judge.
                }
                WordType::Int => break,
                WordType::Free => {
                    return Err(Violation::new(
                        crate::violation::ViolationKind::Access,
                        format!("cannot access free object (ptr = {})", ptr.dump()),
                    ));
                }
                _ => {
                    return Err(Violation::new(
                        crate::violation::ViolationKind::Type,
                        format!(
                            "cannot access {} bytes as int, span contains non-ints (ptr = {})",
                            bytes,
                            ptr.dump()
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Full int access check: common plus per-word lazy typing.
///
/// A zero-byte access is vacuously legal and performs no type transition.
pub fn check_access_int(ptr: CapPtr, bytes: usize, kind: AccessKind) -> Result<(), Violation> {
    if bytes == 0 {
        return Ok(());
    }
    check_access_common(ptr, bytes, kind)?;
    check_int_words(ptr, bytes)
}

/// Full ptr access check: common, 16-byte alignment, and lazy `Unset -> Ptr`
/// typing of the single covering word.
pub fn check_access_ptr(ptr: CapPtr, kind: AccessKind) -> Result<(), Violation> {
    check_access_common(ptr, WORD_SIZE, kind)?;

    let object = ptr.object().expect("object checked by common");
    let offset = ptr.addr() - object.lower() as usize;
    ensure!(
        offset % WORD_SIZE == 0,
        Access,
        "cannot access memory as ptr without 16-byte alignment; ptr % 16 = {} (ptr = {})",
        offset % WORD_SIZE,
        ptr.dump()
    );
    let index = offset / WORD_SIZE;

    loop {
        let word_type = object.word_type(index);
        match word_type {
            WordType::Unset => {
                if object.cas_word_type(index, WordType::Unset, WordType::Ptr).is_ok() {
                    return Ok(());
                }
            }
            WordType::Ptr => return Ok(()),
            WordType::Free => {
                return Err(Violation::new(
                    crate::violation::ViolationKind::Access,
                    format!("cannot access free object (ptr = {})", ptr.dump()),
                ));
            }
            _ => {
                return Err(Violation::new(
                    crate::violation::ViolationKind::Type,
                    format!(
                        "cannot access {WORD_SIZE} bytes as ptr, word is non-ptr (ptr = {})",
                        ptr.dump()
                    ),
                ));
            }
        }
    }
}

/// Special access check: the object must carry the `SPECIAL` flag, the
/// address must be exactly the base, and the sole word tag must equal the
/// expected kind. Special tags are fixed at creation, so there is no lazy
/// transition here.
pub fn check_access_special(ptr: CapPtr, expected: WordType) -> Result<(), Violation> {
    debug_assert!(expected.is_special());
    validate_ptr(ptr)?;

    let Some(object) = ptr.object() else {
        return Err(Violation::new(
            crate::violation::ViolationKind::Access,
            format!("cannot access pointer with null object (ptr = {})", ptr.dump()),
        ));
    };

    ensure!(
        ptr.addr() == object.lower() as usize,
        Access,
        "cannot access pointer as {expected:?} with ptr != lower (ptr = {})",
        ptr.dump()
    );
    ensure!(
        object.has_flags(FLAG_SPECIAL),
        Access,
        "cannot access pointer as {expected:?}, object isn't even special (ptr = {})",
        ptr.dump()
    );
    ensure!(
        object.word_type(0) == expected,
        Type,
        "cannot access pointer as {expected:?}, object has wrong special type (ptr = {})",
        ptr.dump()
    );
    Ok(())
}

/// Check for calling through a capability.
pub fn check_function_call(ptr: CapPtr) -> Result<(), Violation> {
    check_access_special(ptr, WordType::Function)
}

// ============================================================================
// Checked capability and int access
// ============================================================================

/// Loads the capability stored at `ptr` after the ptr check.
pub fn cap_load(ptr: CapPtr) -> Result<CapPtr, Violation> {
    check_access_ptr(ptr, AccessKind::Read)?;
    let object = ptr.object().expect("object checked");
    let index = object.word_index_of(ptr.addr());
    // SAFETY: The check proved the word is in bounds and pointer-typed.
    Ok(unsafe { object.cap_word(index) }.load())
}

/// Stores `value` into the capability word at `ptr` after the ptr check,
/// running the collector's store barrier on the new target.
pub fn cap_store(thread: &Thread, ptr: CapPtr, value: CapPtr) -> Result<(), Violation> {
    check_access_ptr(ptr, AccessKind::Write)?;
    let object = ptr.object().expect("object checked");
    let index = object.word_index_of(ptr.addr());
    crate::gc::store_barrier(thread, value.object());
    // SAFETY: The check proved the word is in bounds and pointer-typed.
    unsafe { object.cap_word(index) }.store(value);
    Ok(())
}

/// Reads `dst.len()` bytes of int-typed payload starting at `ptr`.
pub fn read_int_bytes(ptr: CapPtr, dst: &mut [u8]) -> Result<(), Violation> {
    check_access_int(ptr, dst.len(), AccessKind::Read)?;
    if !dst.is_empty() {
        // SAFETY: The int check proved the whole range is in bounds and
        // readable as raw bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.addr() as *const u8, dst.as_mut_ptr(), dst.len());
        }
    }
    Ok(())
}

/// Writes `src` into int-typed payload starting at `ptr`.
pub fn write_int_bytes(ptr: CapPtr, src: &[u8]) -> Result<(), Violation> {
    check_access_int(ptr, src.len(), AccessKind::Write)?;
    if !src.is_empty() {
        // SAFETY: As in read_int_bytes, for writing.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.addr() as *mut u8, src.len());
        }
    }
    Ok(())
}
