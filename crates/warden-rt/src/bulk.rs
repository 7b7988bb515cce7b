//! Type-aware bulk memory operations.
//!
//! These are word-granularity routines that respect the per-word tags:
//!
//! * `memset` of zero over still-`Unset` words goes through a fast
//!   word-at-a-time atomic zero store with no type check - storing zero
//!   into an `Unset` word is always legal and leaves it `Unset`, keeping
//!   blank memory reinterpretable. Nonzero fills and misaligned "smidgen"
//!   edges take the int-check path.
//! * `memmove` copies word by word, with each destination word's fate
//!   decided by the source word's concrete type; an all-zero source word is
//!   always legal regardless of either side's type. The routine doubles as
//!   the marshalling primitive across the native/managed call boundary, so
//!   it supports an unbarriered, not-pollchecked mode for short bounded
//!   return-buffer copies.
//! * `memcmp` compares raw payload bytes across int- and pointer-typed
//!   words alike; see the function for why this is deliberately permissive.

use crate::check::{check_access_common, check_accessible, check_int_words, AccessKind};
use crate::heap::MAX_BYTES_BETWEEN_POLLCHECKS;
use crate::object::{CapWord, WordType, FLAG_RETURN_BUFFER, WORD_SIZE};
use crate::ptr::CapPtr;
use crate::thread::Thread;
use crate::violation::{ensure, Violation, ViolationKind};

/// Whether a copy runs the collector's store barrier on copied pointer
/// words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierMode {
    /// General-purpose copies: barrier every copied pointer word.
    Barriered,
    /// Return-buffer marshalling: the destination is never scanned.
    Unbarriered,
}

/// Whether a copy offers safe points while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollcheckMode {
    /// General-purpose copies of unbounded size.
    Pollchecked,
    /// Short bounded copies that must not exit.
    NotPollchecked,
}

#[inline]
const fn round_up_to_word(value: usize) -> usize {
    value.next_multiple_of(WORD_SIZE)
}

#[inline]
const fn round_down_to_word(value: usize) -> usize {
    value & !(WORD_SIZE - 1)
}

#[inline]
unsafe fn word_at(addr: usize) -> &'static CapWord {
    // SAFETY: Caller guarantees addr is a word-aligned, in-bounds payload
    // address of a live object.
    unsafe { &*(addr as *const CapWord) }
}

/// Word-at-a-time atomic zero fill of an aligned range. Legal with no type
/// check: zero never tears a capability and never forces a type
/// transition.
fn safe_bzero(raw: usize, bytes: usize) {
    debug_assert!(raw % WORD_SIZE == 0 && bytes % WORD_SIZE == 0);
    let mut addr = raw;
    let end = raw + bytes;
    while addr < end {
        // SAFETY: Caller verified the range is in-bounds payload.
        unsafe { word_at(addr) }.store_raw(0, 0);
        addr += WORD_SIZE;
    }
}

/// Zero fill that pins the object and steps outside the safety envelope
/// when the range exceeds the pollcheck budget.
fn safe_bzero_with_exit(thread: &Thread, ptr: CapPtr, raw: usize, bytes: usize) -> Result<(), Violation> {
    if bytes <= MAX_BYTES_BETWEEN_POLLCHECKS || !thread.is_entered() {
        safe_bzero(raw, bytes);
        return Ok(());
    }
    let object = ptr.object().expect("caller checked");
    object.pin()?;
    thread.exit();
    safe_bzero(raw, bytes);
    thread.enter();
    object.unpin();
    Ok(())
}

/// Type-aware memset.
///
/// # Errors
///
/// Access violation on bad bounds or freed objects, type violation when a
/// nonzero fill (or a misaligned edge) covers pointer-typed words.
pub fn memset(thread: &Thread, ptr: CapPtr, value: u8, count: usize) -> Result<(), Violation> {
    if count == 0 {
        return Ok(());
    }
    check_access_common(ptr, count, AccessKind::Write)?;

    let start = ptr.addr();
    let end = start + count;

    if value != 0 {
        // Nonzero bytes over a pointer word would forge a capability, so
        // the whole range must check as int.
        check_int_words(ptr, count)?;
        let object = ptr.object().expect("checked");
        if count > MAX_BYTES_BETWEEN_POLLCHECKS && thread.is_entered() {
            object.pin()?;
            thread.exit();
            // SAFETY: Range checked in-bounds; object pinned while we are
            // outside the envelope.
            unsafe { std::ptr::write_bytes(start as *mut u8, value, count) };
            thread.enter();
            object.unpin();
        } else {
            // SAFETY: As above.
            unsafe { std::ptr::write_bytes(start as *mut u8, value, count) };
        }
        return Ok(());
    }

    let aligned_start = round_up_to_word(start);
    let aligned_end = round_down_to_word(end);

    if aligned_start > end || aligned_end < start {
        // Entirely inside one word: plain int path.
        check_int_words(ptr, count)?;
        // SAFETY: Range checked in-bounds.
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, count) };
        return Ok(());
    }

    if aligned_start > start {
        check_int_words(ptr, aligned_start - start)?;
        // SAFETY: Smidgen is inside the checked range.
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, aligned_start - start) };
    }
    check_accessible(ptr)?;
    safe_bzero_with_exit(thread, ptr, aligned_start, aligned_end - aligned_start)?;
    if end > aligned_end {
        check_int_words(ptr.with_addr(aligned_end), end - aligned_end)?;
        // SAFETY: As above.
        unsafe { std::ptr::write_bytes(aligned_end as *mut u8, 0, end - aligned_end) };
    }
    Ok(())
}

enum SmidgenPart {
    Lower,
    Upper,
}

/// Copies the misaligned leading/trailing byte range under the int-check
/// discipline. Pointers can never straddle a copy's misaligned edge.
fn copy_smidgen(
    part: &SmidgenPart,
    dst: CapPtr,
    src: CapPtr,
    dst_start: usize,
    aligned_dst_start: usize,
    dst_end: usize,
    aligned_dst_end: usize,
    src_start: usize,
) -> Result<(), Violation> {
    match part {
        SmidgenPart::Lower => {
            if aligned_dst_start > dst_start {
                let bytes = aligned_dst_start - dst_start;
                check_int_words(dst, bytes)?;
                check_int_words(src, bytes)?;
                // SAFETY: Both ranges checked; copy handles overlap.
                unsafe {
                    std::ptr::copy(src_start as *const u8, dst_start as *mut u8, bytes);
                }
            }
        }
        SmidgenPart::Upper => {
            if dst_end > aligned_dst_end {
                let bytes = dst_end - aligned_dst_end;
                let offset = aligned_dst_end - dst_start;
                check_int_words(dst.with_addr(aligned_dst_end), bytes)?;
                check_int_words(src.with_addr(src_start + offset), bytes)?;
                // SAFETY: As above.
                unsafe {
                    std::ptr::copy(
                        (src_start + offset) as *const u8,
                        aligned_dst_end as *mut u8,
                        bytes,
                    );
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn memmove_impl(
    thread: &Thread,
    dst: CapPtr,
    src: CapPtr,
    count: usize,
    barriered: BarrierMode,
    pollchecked: PollcheckMode,
) -> Result<(), Violation> {
    let dst_object = dst.object().expect("caller checked");
    let src_object = src.object().expect("caller checked");

    let dst_start = dst.addr();
    let src_start = src.addr();
    let dst_end = dst_start + count;
    let aligned_dst_start = round_up_to_word(dst_start);
    let aligned_dst_end = round_down_to_word(dst_end);

    if aligned_dst_start > dst_end || aligned_dst_end < dst_start {
        check_int_words(dst, count)?;
        check_int_words(src, count)?;
        // SAFETY: Both ranges checked as int; copy handles overlap.
        unsafe { std::ptr::copy(src_start as *const u8, dst_start as *mut u8, count) };
        return Ok(());
    }

    // Ascending vs. descending traversal, exactly as a classic overlapping
    // memmove chooses it.
    let is_up = dst_start < src_start;

    copy_smidgen(
        if is_up { &SmidgenPart::Lower } else { &SmidgenPart::Upper },
        dst,
        src,
        dst_start,
        aligned_dst_start,
        dst_end,
        aligned_dst_end,
        src_start,
    )?;

    // Pointers can only flow when source and destination words line up.
    let src_can_have_ptrs = dst_start % WORD_SIZE == src_start % WORD_SIZE;

    check_accessible(dst)?;
    if src_can_have_ptrs {
        check_accessible(src)?;
    } else {
        check_int_words(src, count)?;
    }

    let mut cur_dst = aligned_dst_start;
    let mut cur_src = src_start + (aligned_dst_start - dst_start);
    let mut dst_index = dst_object.word_index_of(cur_dst);
    let mut src_index = src_object.word_index_of(round_down_to_word(cur_src));
    let mut countdown = (aligned_dst_end - aligned_dst_start) / WORD_SIZE;

    if !is_up && countdown > 0 {
        let back = countdown - 1;
        cur_dst += back * WORD_SIZE;
        cur_src += back * WORD_SIZE;
        dst_index += back;
        src_index += back;
    }

    let backoff = crossbeam::utils::Backoff::new();
    while countdown > 0 {
        countdown -= 1;
        loop {
            let (src_word_type, low, high) = if src_can_have_ptrs {
                let word_type = src_object.word_type(src_index);
                // SAFETY: cur_src is word-aligned (same misalignment as
                // dst, which is aligned here) and in checked bounds.
                let (low, high) = unsafe { word_at(cur_src) }.load_raw();
                (word_type, low, high)
            } else {
                // SAFETY: The whole source range passed the int check.
                let low = unsafe { std::ptr::read_unaligned(cur_src as *const usize) };
                let high =
                    unsafe { std::ptr::read_unaligned((cur_src + WORD_SIZE / 2) as *const usize) };
                (WordType::Int, low, high)
            };

            if low == 0 && high == 0 {
                // A literal all-zero word is always legal regardless of
                // source or destination type and forces no transition.
                // SAFETY: cur_dst is word-aligned and in checked bounds.
                unsafe { word_at(cur_dst) }.store_raw(0, 0);
                break;
            }

            if src_word_type == WordType::Unset {
                // Raced a first touch: the word is nonzero, so someone is
                // concretizing it right now. Reload and see the result.
                backoff.spin();
                continue;
            }

            ensure!(
                matches!(src_word_type, WordType::Int | WordType::Ptr),
                Type,
                "cannot copy anything but int or ptr (dst = {}, src = {})",
                dst.with_addr(cur_dst).dump(),
                src.with_addr(cur_src).dump()
            );

            let dst_word_type = dst_object.word_type(dst_index);
            if dst_word_type == WordType::Unset {
                if dst_object
                    .cas_word_type(dst_index, WordType::Unset, src_word_type)
                    .is_err()
                {
                    continue;
                }
            } else {
                ensure!(
                    src_word_type == dst_word_type,
                    Type,
                    "type mismatch while copying (dst = {}, src = {})",
                    dst.with_addr(cur_dst).dump(),
                    src.with_addr(cur_src).dump()
                );
            }

            if src_word_type == WordType::Ptr && barriered == BarrierMode::Barriered {
                let copied = CapPtr::from_parts(high as *const crate::object::ObjectHeader, low);
                crate::gc::store_barrier(thread, copied.object());
            }
            // SAFETY: As above.
            unsafe { word_at(cur_dst) }.store_raw(low, high);
            break;
        }

        if is_up {
            cur_dst += WORD_SIZE;
            cur_src += WORD_SIZE;
            dst_index += 1;
            src_index += 1;
        } else if countdown > 0 {
            cur_dst -= WORD_SIZE;
            cur_src -= WORD_SIZE;
            dst_index -= 1;
            src_index -= 1;
        }

        if pollchecked == PollcheckMode::Pollchecked && thread.pollcheck() {
            // The world may have moved while we were at the safe point.
            check_accessible(dst)?;
            check_accessible(src)?;
        }
    }

    copy_smidgen(
        if is_up { &SmidgenPart::Upper } else { &SmidgenPart::Lower },
        dst,
        src,
        dst_start,
        aligned_dst_start,
        dst_end,
        aligned_dst_end,
        src_start,
    )
}

/// Type-aware overlapping copy (barriered, pollchecked).
///
/// # Errors
///
/// Access violation on bad bounds/freed objects; type violation when
/// concretely-typed source and destination words disagree.
pub fn memmove(thread: &Thread, dst: CapPtr, src: CapPtr, count: usize) -> Result<(), Violation> {
    if count == 0 {
        return Ok(());
    }
    check_access_common(dst, count, AccessKind::Write)?;
    check_access_common(src, count, AccessKind::Read)?;
    memmove_impl(
        thread,
        dst,
        src,
        count,
        BarrierMode::Barriered,
        PollcheckMode::Pollchecked,
    )
}

/// `memcpy` is the same checked word copy; overlap direction is resolved
/// identically.
///
/// # Errors
///
/// As for [`memmove`].
pub fn memcpy(thread: &Thread, dst: CapPtr, src: CapPtr, count: usize) -> Result<(), Violation> {
    memmove(thread, dst, src, count)
}

/// The marshalling fast path: unbarriered and not pollchecked, for short
/// bounded copies into a return buffer.
///
/// # Errors
///
/// As for [`memmove`]; additionally requires the destination to be a
/// return buffer.
pub fn memcpy_for_return_buffer(
    thread: &Thread,
    dst: CapPtr,
    src: CapPtr,
    count: usize,
) -> Result<(), Violation> {
    let Some(dst_object) = dst.object() else {
        return Err(Violation::new(
            ViolationKind::Access,
            format!("cannot marshal into null destination (dst = {})", dst.dump()),
        ));
    };
    debug_assert!(dst_object.has_flags(FLAG_RETURN_BUFFER));
    if count == 0 {
        return Ok(());
    }
    check_access_common(dst, count, AccessKind::Write)?;
    check_access_common(src, count, AccessKind::Read)?;
    memmove_impl(
        thread,
        dst,
        src,
        count,
        BarrierMode::Unbarriered,
        PollcheckMode::NotPollchecked,
    )
}

/// Raw byte comparison.
///
/// Deliberately permissive about word types: int-typed bytes may be
/// compared against pointer-typed bytes. Tightening this would break
/// byte-introspection idioms over mixed buffers, and reading a capability's
/// raw bytes discloses nothing the capability's own address did not.
///
/// # Errors
///
/// Access violation on bad bounds or freed/special operands.
pub fn memcmp(a: CapPtr, b: CapPtr, count: usize) -> Result<i32, Violation> {
    if count == 0 {
        return Ok(0);
    }
    check_access_common(a, count, AccessKind::Read)?;
    check_access_common(b, count, AccessKind::Read)?;
    check_accessible(a)?;
    check_accessible(b)?;

    let left = a.addr() as *const u8;
    let right = b.addr() as *const u8;
    for offset in 0..count {
        // SAFETY: Both ranges are in checked bounds.
        let (lhs, rhs) = unsafe { (*left.add(offset), *right.add(offset)) };
        if lhs != rhs {
            return Ok(i32::from(lhs) - i32::from(rhs));
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::{memcmp, memmove, memset};
    use crate::check::{self, AccessKind};
    use crate::object::{WordType, WORD_SIZE};
    use crate::ptr::CapPtr;
    use crate::thread::Thread;
    use crate::violation::ViolationKind;
    use crate::heap;

    #[test]
    fn test_zero_memset_keeps_unset_words_unset() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = heap::allocate(&thread, WORD_SIZE * 4);
        let ptr = CapPtr::from_object(object);

        memset(&thread, ptr, 0, WORD_SIZE * 4).unwrap();
        for index in 0..4 {
            assert_eq!(object.word_type(index), WordType::Unset);
        }
    }

    #[test]
    fn test_misaligned_zero_memset_types_the_edges() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = heap::allocate(&thread, WORD_SIZE * 4);
        let ptr = CapPtr::from_object(object).with_offset(4);

        memset(&thread, ptr, 0, WORD_SIZE * 3).unwrap();
        // Leading and trailing smidgens force Int; interior words stay Unset.
        assert_eq!(object.word_type(0), WordType::Int);
        assert_eq!(object.word_type(1), WordType::Unset);
        assert_eq!(object.word_type(2), WordType::Unset);
        assert_eq!(object.word_type(3), WordType::Int);
    }

    #[test]
    fn test_nonzero_memset_over_ptr_word_fails() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = heap::allocate(&thread, WORD_SIZE);
        let ptr = CapPtr::from_object(object);
        check::check_access_ptr(ptr, AccessKind::Write).unwrap();

        let err = memset(&thread, ptr, 0xaa, WORD_SIZE).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::Type);
    }

    #[test]
    fn test_memmove_copies_capabilities_with_types() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let target = heap::allocate(&thread, 16);
        let src = heap::allocate(&thread, WORD_SIZE * 2);
        let dst = heap::allocate(&thread, WORD_SIZE * 2);
        // The copy pollchecks, so these must be rooted across it.
        for object in [target, src, dst] {
            crate::gc::register_test_root(object);
        }
        let src_cap = CapPtr::from_object(src);
        let dst_cap = CapPtr::from_object(dst);

        check::cap_store(&thread, src_cap, CapPtr::from_object(target)).unwrap();
        check::write_int_bytes(src_cap.with_offset(WORD_SIZE), &[5u8; WORD_SIZE]).unwrap();

        memmove(&thread, dst_cap, src_cap, WORD_SIZE * 2).unwrap();

        assert_eq!(dst.word_type(0), WordType::Ptr);
        assert_eq!(dst.word_type(1), WordType::Int);
        let copied = check::cap_load(dst_cap).unwrap();
        assert_eq!(copied.object(), Some(target));
    }

    #[test]
    fn test_memmove_type_mismatch_fails() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let target = heap::allocate(&thread, 16);
        let src = heap::allocate(&thread, WORD_SIZE);
        let dst = heap::allocate(&thread, WORD_SIZE);
        for object in [target, src, dst] {
            crate::gc::register_test_root(object);
        }
        let src_cap = CapPtr::from_object(src);
        let dst_cap = CapPtr::from_object(dst);

        check::cap_store(&thread, src_cap, CapPtr::from_object(target)).unwrap();
        check::write_int_bytes(dst_cap, &[9u8; WORD_SIZE]).unwrap();

        let err = memmove(&thread, dst_cap, src_cap, WORD_SIZE).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::Type);
        assert!(err.message().contains("type mismatch"));
    }

    #[test]
    fn test_overlapping_memmove_descending() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let object = heap::allocate(&thread, WORD_SIZE * 4);
        crate::gc::register_test_root(object);
        let base = CapPtr::from_object(object);

        let mut bytes = [0u8; WORD_SIZE * 3];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::try_from(index & 0xff).unwrap();
        }
        check::write_int_bytes(base, &bytes).unwrap();

        // Shift right by one word: dst > src, descending traversal.
        memmove(&thread, base.with_offset(WORD_SIZE), base, WORD_SIZE * 3).unwrap();

        let mut shifted = [0u8; WORD_SIZE * 3];
        check::read_int_bytes(base.with_offset(WORD_SIZE), &mut shifted).unwrap();
        assert_eq!(shifted, bytes);
    }

    #[test]
    fn test_memcmp_tolerates_mixed_word_kinds() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let target = heap::allocate(&thread, 16);
        let a = heap::allocate(&thread, WORD_SIZE);
        let b = heap::allocate(&thread, WORD_SIZE);
        let a_cap = CapPtr::from_object(a);
        let b_cap = CapPtr::from_object(b);

        check::cap_store(&thread, a_cap, CapPtr::from_object(target)).unwrap();
        check::write_int_bytes(b_cap, &[0u8; WORD_SIZE]).unwrap();

        // Comparing ptr-typed bytes to int-typed bytes is legal.
        assert!(memcmp(a_cap, b_cap, WORD_SIZE).is_ok());
    }

    #[test]
    fn test_memcmp_equal_and_ordering() {
        let thread = Thread::attach_or_current();
        let _enter = thread.enter_guard();
        let a = heap::allocate(&thread, 32);
        let b = heap::allocate(&thread, 32);
        let a_cap = CapPtr::from_object(a);
        let b_cap = CapPtr::from_object(b);

        check::write_int_bytes(a_cap, &[1, 2, 3, 4]).unwrap();
        check::write_int_bytes(b_cap, &[1, 2, 3, 5]).unwrap();

        assert_eq!(memcmp(a_cap, b_cap, 3).unwrap(), 0);
        assert!(memcmp(a_cap, b_cap, 4).unwrap() < 0);
        assert!(memcmp(b_cap, a_cap, 4).unwrap() > 0);
    }
}
