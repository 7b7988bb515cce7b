//! Allocation and object lifecycle.
//!
//! Objects come from the tracing heap: a raw allocation holds the header,
//! the per-word tag array, and (except for mmap-backed objects) the payload.
//! Every allocation is zero-filled, tagged, and published behind a
//! store-store fence - mandatory because the object may be handed to
//! another thread or discovered by the collector immediately after return,
//! and readers must observe fully-initialized tags.
//!
//! Freeing is a one-way, non-reclaiming transition: the `FREE` flag is set
//! by CAS (rejecting double frees), every word tag becomes `Free`, and the
//! storage stays put until the collector proves the object unreachable.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::io;
use std::sync::atomic::{fence, Ordering};

use crate::gc;
use crate::object::{
    init_header, ObjectLayout, ObjectRef, WordType, FLAG_FREE, FLAG_GLOBAL, FLAG_MMAP,
    FLAG_READONLY, FLAG_RETURN_BUFFER, FLAG_SPECIAL, WORD_SIZE,
};
use crate::ptr::CapPtr;
use crate::runtime::runtime;
use crate::thread::Thread;
use crate::violation::{ensure, Violation};

/// Upper bound on non-atomic work between safe points. Allocations and bulk
/// operations larger than this bracket their long-running span with either
/// a pin + exit/enter pair or an allocation-root declaration.
pub const MAX_BYTES_BETWEEN_POLLCHECKS: usize = 64 * 1024;

fn raw_allocate(layout: &ObjectLayout) -> *mut u8 {
    let alloc_layout = Layout::from_size_align(layout.total_size.max(1), layout.align)
        .expect("object layout overflow");
    // SAFETY: Layout is valid and nonzero.
    let raw = unsafe { alloc_zeroed(alloc_layout) };
    if raw.is_null() {
        handle_alloc_error(alloc_layout);
    }
    raw
}

fn allocate_impl(
    thread: &Thread,
    size: usize,
    align: usize,
    flags: u32,
    initial_word_type: WordType,
) -> ObjectRef {
    debug_assert!(matches!(initial_word_type, WordType::Unset | WordType::Int));
    let layout = ObjectLayout::for_payload(size, align);
    let raw = raw_allocate(&layout);

    // SAFETY: raw_allocate returned layout.total_size zeroed bytes; the
    // payload bounds are inside that allocation.
    let object = unsafe {
        let lower = raw.add(layout.offset_to_payload);
        let upper = lower.add(layout.num_words * WORD_SIZE);
        init_header(raw, &layout, lower, upper, flags, WordType::Unset)
    };

    if initial_word_type == WordType::Int {
        // Tagging a huge object is a long non-atomic span; declare the
        // object an allocation root and step outside the safety envelope.
        let bracket = size > MAX_BYTES_BETWEEN_POLLCHECKS && thread.is_entered();
        if bracket {
            thread.exit_with_allocation_root(object);
        }
        for index in 0..layout.num_words {
            object.store_word_type(index, WordType::Int);
        }
        if bracket {
            thread.enter_with_allocation_root(object);
        }
    }

    publish(object, size);
    thread.note_allocation(size);
    object
}

/// Publication: the store-store fence, allocate-black during a cycle, and
/// registration with the sweep.
fn publish(object: ObjectRef, size: usize) {
    fence(Ordering::Release);
    if gc::is_marking() {
        let _ = object.test_and_set_marked();
    }
    runtime().collector.register_object(object, size);
}

/// Allocates `size` bytes of fresh `Unset`-typed, zero-filled payload.
#[must_use]
pub fn allocate(thread: &Thread, size: usize) -> ObjectRef {
    allocate_impl(thread, size, WORD_SIZE, 0, WordType::Unset)
}

/// Allocates integer-only payload: every word starts concretely `Int`.
#[must_use]
pub fn allocate_int(thread: &Thread, size: usize) -> ObjectRef {
    allocate_impl(thread, size, WORD_SIZE, 0, WordType::Int)
}

/// Allocates with a caller-supplied power-of-two payload alignment.
///
/// Alignments below the word size are rounded up to it.
#[must_use]
pub fn allocate_with_alignment(thread: &Thread, size: usize, align: usize) -> ObjectRef {
    let align = align.max(WORD_SIZE);
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    allocate_impl(thread, size, align, 0, WordType::Unset)
}

/// Allocates global-variable storage: immortal, never freeable.
#[must_use]
pub fn allocate_global(thread: &Thread, size: usize) -> ObjectRef {
    allocate_impl(thread, size, WORD_SIZE, FLAG_GLOBAL, WordType::Unset)
}

/// Allocates a read-only object (writes trap after initialization via the
/// unchecked payload, which only the runtime performs).
#[must_use]
pub fn allocate_readonly(thread: &Thread, size: usize) -> ObjectRef {
    allocate_impl(thread, size, WORD_SIZE, FLAG_READONLY, WordType::Unset)
}

/// Allocates a transient return buffer for call-result marshalling. Return
/// buffers are never scanned by the collector and never barriered.
#[must_use]
pub fn allocate_return_buffer(thread: &Thread, size: usize) -> ObjectRef {
    allocate_impl(thread, size, WORD_SIZE, FLAG_RETURN_BUFFER, WordType::Unset)
}

/// Allocates an mmap-backed object. The payload is a fresh anonymous
/// mapping rounded up to whole pages; generic `free` is forbidden on the
/// result and reclamation unmaps at sweep time.
///
/// # Errors
///
/// Returns the OS error if the mapping cannot be created.
pub fn allocate_mmap(thread: &Thread, size: usize) -> io::Result<ObjectRef> {
    let page = sys_alloc::page_size();
    let len = size.max(1).next_multiple_of(page);
    let map = sys_alloc::MmapOptions::new().len(len).map_anon()?;
    let (base, len) = map.into_raw();

    let layout = ObjectLayout::header_only(len / WORD_SIZE);
    let raw = raw_allocate(&layout);
    // SAFETY: raw holds header+tags; the payload bounds describe the
    // mapping we just took ownership of.
    let object = unsafe {
        init_header(
            raw,
            &layout,
            base,
            base.add(len),
            FLAG_MMAP,
            WordType::Unset,
        )
    };
    publish(object, len);
    thread.note_allocation(len);
    Ok(object)
}

/// Allocates a one-word special object owning `payload`. The payload is
/// dropped by the sweep when the object is reclaimed.
///
/// Usable before any thread is attached (the runtime bootstraps its own
/// thread objects through here), so it takes no thread argument and never
/// exits.
#[must_use]
pub fn allocate_special<T: Send + Sync + 'static>(kind: WordType, payload: T) -> ObjectRef {
    assert!(kind.is_special() && kind.has_destructor());
    unsafe fn drop_payload<T>(raw: *mut u8) {
        // SAFETY: raw came from Box::into_raw::<T> below.
        drop(unsafe { Box::from_raw(raw.cast::<T>()) });
    }
    let raw_payload = Box::into_raw(Box::new(payload)).cast::<u8>();
    allocate_special_raw(kind, raw_payload, Some(drop_payload::<T>))
}

/// Allocates a special object wrapping externally-provided storage without
/// copying (function and dynamic-library handles). Nothing is dropped at
/// reclaim time.
#[must_use]
pub fn allocate_special_with_raw_payload(kind: WordType, payload: *mut u8) -> ObjectRef {
    assert!(matches!(kind, WordType::Function | WordType::DlHandle));
    allocate_special_raw(kind, payload, None)
}

fn allocate_special_raw(
    kind: WordType,
    payload: *mut u8,
    drop_fn: Option<unsafe fn(*mut u8)>,
) -> ObjectRef {
    let layout = ObjectLayout::for_payload(WORD_SIZE, WORD_SIZE);
    let raw = raw_allocate(&layout);
    // SAFETY: As in allocate_impl.
    let object = unsafe {
        let lower = raw.add(layout.offset_to_payload);
        let upper = lower.add(WORD_SIZE);
        let object = init_header(raw, &layout, lower, upper, FLAG_SPECIAL, WordType::Unset);
        object.store_word_type(0, kind);
        object.cap_word(0).store_special(payload, drop_fn);
        object
    };
    publish(object, WORD_SIZE);
    object
}

/// Typed accessor for a special object's payload after a kind check.
///
/// # Errors
///
/// Propagates the special access check failure.
pub fn special_payload<T>(ptr: CapPtr, kind: WordType) -> Result<&'static T, Violation> {
    crate::check::check_access_special(ptr, kind)?;
    let object = ptr.object().expect("object checked");
    // SAFETY: The special check verified the kind, which is fixed at
    // creation along with the payload type.
    Ok(unsafe { object.special_payload::<T>() })
}

/// Reallocates `old` to `new_size` bytes, preserving each copied word's
/// concrete type (re-validating lazy `Unset` races exactly as the int
/// check does) and applying the store barrier to every copied pointer
/// word. New words start `Unset`. The old object is freed afterwards.
///
/// # Errors
///
/// Fails if `old` is freed or special.
pub fn reallocate(thread: &Thread, old: ObjectRef, new_size: usize) -> Result<ObjectRef, Violation> {
    ensure!(
        !old.has_flags(FLAG_FREE) && !old.has_flags(FLAG_SPECIAL),
        Access,
        "cannot reallocate free or special object ({})",
        old.dump()
    );
    let new = allocate(thread, new_size);
    let common_words = new.num_words().min(old.num_words());

    let backoff = crossbeam::utils::Backoff::new();
    for index in 0..common_words {
        loop {
            let word_type = old.word_type(index);
            // SAFETY: index < num_words of both objects; both payloads live.
            let (low, high) = unsafe { old.cap_word(index).load_raw() };
            if word_type == WordType::Unset && (low != 0 || high != 0) {
                // We raced someone initializing the word; once more around
                // and we will observe it concretely typed.
                backoff.spin();
                continue;
            }
            if word_type == WordType::Ptr {
                // The destination is a fresh, possibly-already-marked object
                // while the source may be arbitrary, so the barrier is
                // mandatory here.
                let cap = unsafe { old.cap_word(index) }.load();
                gc::store_barrier(thread, cap.object());
            }
            new.store_word_type(index, word_type);
            // SAFETY: As above.
            unsafe { new.cap_word(index).store_raw(low, high) };
            break;
        }
        if new_size > MAX_BYTES_BETWEEN_POLLCHECKS && index % 4096 == 4095 {
            thread.pollcheck();
        }
    }

    fence(Ordering::Release);
    free(thread, CapPtr::from_object(old))?;
    Ok(new)
}

/// Explicitly frees an object: rejects special/global/mmap objects, then
/// poisons it without reclaiming storage.
///
/// # Errors
///
/// Lifecycle violation on forbidden object classes, double free, or a
/// pinned object.
pub fn free(thread: &Thread, ptr: CapPtr) -> Result<(), Violation> {
    let Some(object) = ptr.object() else {
        ensure!(
            ptr.is_totally_null(),
            Lifecycle,
            "cannot free pointer with no object (ptr = {})",
            ptr.dump()
        );
        // free(NULL) is a no-op.
        return Ok(());
    };
    ensure!(
        !object.has_flags(FLAG_SPECIAL),
        Lifecycle,
        "cannot free special object ({})",
        object.dump()
    );
    ensure!(
        !object.has_flags(FLAG_GLOBAL),
        Lifecycle,
        "cannot free global object ({})",
        object.dump()
    );
    ensure!(
        !object.has_flags(FLAG_MMAP),
        Lifecycle,
        "cannot free mmap object ({})",
        object.dump()
    );
    free_object(thread, object)
}

/// The flag-and-poison core of free, shared with reallocate and munmap.
///
/// No deletion barrier is needed: from the collector's standpoint this is
/// not "pointer becomes null", it is "object becomes opaque" - its
/// outgoing pointers are simply no longer scanned.
pub(crate) fn free_object(thread: &Thread, object: ObjectRef) -> Result<(), Violation> {
    object.try_set_free_flag()?;
    let bracket = object.size() > MAX_BYTES_BETWEEN_POLLCHECKS && thread.is_entered();
    if bracket {
        thread.exit();
    }
    for index in 0..object.num_words() {
        object.store_word_type(index, WordType::Free);
    }
    if bracket {
        thread.enter();
    }
    Ok(())
}

/// Unmaps an mmap-backed object. Only the exact full range may be unmapped;
/// a partial munmap is a lifecycle violation. The poisoned object's pages
/// are returned to the OS at sweep time.
///
/// # Errors
///
/// Lifecycle violation for non-mmap objects, partial ranges, or double
/// unmap.
pub fn munmap(thread: &Thread, ptr: CapPtr, len: usize) -> Result<(), Violation> {
    let Some(object) = ptr.object() else {
        return Err(Violation::new(
            crate::violation::ViolationKind::Lifecycle,
            format!("cannot munmap pointer with null object (ptr = {})", ptr.dump()),
        ));
    };
    ensure!(
        object.has_flags(FLAG_MMAP),
        Lifecycle,
        "cannot munmap something that was not mmapped (ptr = {})",
        ptr.dump()
    );
    ensure!(
        ptr.addr() == object.lower() as usize && len == object.size(),
        Lifecycle,
        "partial munmap is not supported (ptr = {}, len = {len})",
        ptr.dump()
    );
    free_object(thread, object)
}

/// Trap-on-failure convenience wrappers matching the instrumented-code
/// entry points.
pub mod api {
    use super::{CapPtr, ObjectRef, Thread};
    use crate::violation::or_trap;

    /// `free` that traps instead of returning the violation.
    pub fn free(thread: &Thread, ptr: CapPtr) {
        or_trap(super::free(thread, ptr));
    }

    /// `reallocate` that traps instead of returning the violation.
    #[must_use]
    pub fn reallocate(thread: &Thread, old: ObjectRef, new_size: usize) -> ObjectRef {
        or_trap(super::reallocate(thread, old, new_size))
    }
}

/// Reclaims a dead object's storage. Called only by the sweep, with
/// unreachability proven.
pub(crate) unsafe fn reclaim(object: ObjectRef) {
    if object.has_flags(FLAG_SPECIAL) {
        // SAFETY: The sweep owns the object now; no capability can reach a
        // special object that was proven unreachable.
        if let Some(drop_fn) = unsafe { object.special_drop_fn() } {
            // SAFETY: drop_fn was registered with a matching payload.
            unsafe { drop_fn(object.special_payload_raw()) };
        }
    } else if object.has_flags(FLAG_MMAP) {
        let len = object.size();
        if len > 0 {
            // SAFETY: The mapping was released to this object at allocation
            // and nobody else unmaps it.
            drop(unsafe { sys_alloc::Mmap::from_raw(object.lower(), len) });
        }
    }
    if let Some(layout) = object.alloc_layout() {
        // SAFETY: The header allocation came from alloc_zeroed with exactly
        // this layout.
        unsafe { std::alloc::dealloc(object.as_ptr().cast_mut().cast::<u8>(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::{allocate, allocate_int, allocate_with_alignment, free};
    use crate::object::{WordType, WORD_SIZE};
    use crate::ptr::CapPtr;
    use crate::thread::Thread;
    use crate::violation::ViolationKind;

    #[test]
    fn test_fresh_object_is_unset_and_zero() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, 48);
        assert_eq!(object.num_words(), 3);
        assert_eq!(object.size(), 48);
        for index in 0..3 {
            assert_eq!(object.word_type(index), WordType::Unset);
        }
        let payload = object.lower();
        for offset in 0..48 {
            assert_eq!(unsafe { *payload.add(offset) }, 0);
        }
    }

    #[test]
    fn test_int_variant_starts_concrete() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate_int(&thread, 32);
        assert_eq!(object.word_type(0), WordType::Int);
        assert_eq!(object.word_type(1), WordType::Int);
    }

    #[test]
    fn test_zero_length_allocation_has_equal_bounds() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, 0);
        assert_eq!(object.lower(), object.upper());
        assert_eq!(object.num_words(), 0);
    }

    #[test]
    fn test_aligned_allocation() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate_with_alignment(&thread, 64, 256);
        assert_eq!(object.lower() as usize % 256, 0);
    }

    #[test]
    fn test_size_rounds_up_to_words() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, 17);
        assert_eq!(object.num_words(), 2);
        assert_eq!(object.size(), 32);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, 16);
        let cap = CapPtr::from_object(object);
        free(&thread, cap).unwrap();
        let err = free(&thread, cap).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::Lifecycle);
        assert!(err.message().contains("already free"));
    }

    #[test]
    fn test_free_poisons_every_word() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, WORD_SIZE * 4);
        free(&thread, CapPtr::from_object(object)).unwrap();
        for index in 0..4 {
            assert_eq!(object.word_type(index), WordType::Free);
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        assert!(free(&thread, CapPtr::forge_null()).is_ok());
    }

    #[test]
    fn test_pinned_object_cannot_be_freed() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = allocate(&thread, 16);
        object.pin().unwrap();
        let err = free(&thread, CapPtr::from_object(object)).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::Lifecycle);
        assert!(err.message().contains("pinned"));
        object.unpin();
        free(&thread, CapPtr::from_object(object)).unwrap();
    }
}
