//! Word-type monotonicity, bounds, and free lifecycle properties.
//!
//! For any freshly allocated object every word starts `Unset`; after a
//! successful int access the word is `Int` until free, after a successful
//! ptr access it is `Ptr` until free, and the other kind of access fails
//! forever after.

use warden_rt::check::{self, AccessKind};
use warden_rt::thread::Thread;
use warden_rt::{heap, CapPtr, ViolationKind, WordType, WORD_SIZE};

#[test]
fn unset_words_commit_to_int_forever() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, WORD_SIZE * 2);
    let ptr = CapPtr::from_object(object);

    assert_eq!(object.word_type(0), WordType::Unset);
    check::check_access_int(ptr, 8, AccessKind::Read).unwrap();
    assert_eq!(object.word_type(0), WordType::Int);

    // The second word was not touched.
    assert_eq!(object.word_type(1), WordType::Unset);

    // A ptr access to the now-int word fails, repeatedly.
    for _ in 0..3 {
        let err = check::check_access_ptr(ptr, AccessKind::Read).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::Type);
    }
    assert_eq!(object.word_type(0), WordType::Int);
}

#[test]
fn unset_words_commit_to_ptr_forever() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, WORD_SIZE);
    let ptr = CapPtr::from_object(object);

    check::check_access_ptr(ptr, AccessKind::Write).unwrap();
    assert_eq!(object.word_type(0), WordType::Ptr);

    let err = check::check_access_int(ptr, 4, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Type);
    assert_eq!(object.word_type(0), WordType::Ptr);
}

#[test]
fn ptr_access_requires_word_alignment() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, WORD_SIZE * 2);
    let ptr = CapPtr::from_object(object).with_offset(8);

    let err = check::check_access_ptr(ptr, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("16-byte alignment"));
    // The failed access performed no type transition.
    assert_eq!(object.word_type(0), WordType::Unset);
}

#[test]
fn int_access_spanning_words_types_each_one() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, WORD_SIZE * 3);
    let ptr = CapPtr::from_object(object).with_offset(WORD_SIZE - 4);

    // 8 bytes starting 4 before a word boundary touch words 0 and 1.
    check::check_access_int(ptr, 8, AccessKind::Write).unwrap();
    assert_eq!(object.word_type(0), WordType::Int);
    assert_eq!(object.word_type(1), WordType::Int);
    assert_eq!(object.word_type(2), WordType::Unset);
}

#[test]
fn bounds_are_half_open() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, 32);
    let base = CapPtr::from_object(object);

    // In-bounds accesses succeed.
    check::check_access_int(base, 32, AccessKind::Read).unwrap();
    check::check_access_int(base.with_offset(31), 1, AccessKind::Read).unwrap();

    // address == upper always fails.
    let at_upper = base.with_offset(32);
    let err = check::check_access_int(at_upper, 1, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("upper"));

    // address + size > upper always fails.
    let err = check::check_access_int(base.with_offset(24), 9, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);

    // address < lower always fails.
    let below = base.with_addr(base.addr() - 1);
    let err = check::check_access_int(below, 1, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("lower"));
}

#[test]
fn zero_length_objects_are_never_dereferenceable() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, 0);

    // Bounds are well-defined and equal.
    assert_eq!(object.lower(), object.upper());

    let ptr = CapPtr::from_object(object);
    let err = check::check_access_int(ptr, 1, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
}

#[test]
fn readonly_objects_reject_writes_but_allow_reads() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate_readonly(&thread, 16);
    let ptr = CapPtr::from_object(object);

    check::check_access_int(ptr, 16, AccessKind::Read).unwrap();
    let err = check::check_access_int(ptr, 16, AccessKind::Write).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("read-only"));
}

#[test]
fn free_transitions_all_words_and_sticks() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, WORD_SIZE * 4);
    let cap = CapPtr::from_object(object);

    check::write_int_bytes(cap, &[1u8; 16]).unwrap();
    check::check_access_ptr(cap.with_offset(WORD_SIZE), AccessKind::Write).unwrap();

    heap::free(&thread, cap).unwrap();
    for index in 0..4 {
        assert_eq!(object.word_type(index), WordType::Free);
    }

    // Freeing again fails.
    let err = heap::free(&thread, cap).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Lifecycle);

    // Every subsequent access through any capability fails with the
    // free-object condition, distinct from an out-of-bounds failure.
    let err = check::check_access_int(cap, 8, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("free"));
    let err = check::check_access_ptr(cap.with_offset(WORD_SIZE), AccessKind::Read).unwrap_err();
    assert!(err.message().contains("free"));
}

#[test]
fn stale_capability_stays_dead_after_address_reuse() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();
    let object = heap::allocate(&thread, 64);
    let stale = CapPtr::from_object(object);
    heap::free(&thread, stale).unwrap();

    // Pile up fresh allocations; even if one lands on the same address,
    // the stale capability still carries the freed object's identity.
    let mut fresh = Vec::new();
    for _ in 0..64 {
        fresh.push(heap::allocate(&thread, 64));
    }
    let err = check::check_access_int(stale, 1, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("free"));
}

#[test]
fn boxed_int_capability_is_arithmetic_only() {
    let boxed = CapPtr::forge_int(41);
    let bumped = boxed.with_offset(1);
    assert_eq!(bumped.addr(), 42);

    let err = check::check_access_int(bumped, 1, AccessKind::Read).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::Access);
    assert!(err.message().contains("null object"));
}
