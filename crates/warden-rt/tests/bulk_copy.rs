//! Bulk-copy round trip: a fully-initialized region of mixed int and
//! pointer words, copied to a fresh `Unset` destination and back to a
//! second fresh destination, must reproduce byte-identical payload and
//! identical per-word types.

use warden_rt::check;
use warden_rt::thread::Thread;
use warden_rt::{bulk, heap, CapPtr, WordType, WORD_SIZE};

const NUM_WORDS: usize = 8;

fn build_mixed_source(thread: &Thread) -> (warden_rt::ObjectRef, Vec<warden_rt::ObjectRef>) {
    let source = heap::allocate(thread, WORD_SIZE * NUM_WORDS);
    let source_cap = CapPtr::from_object(source);
    let mut targets = Vec::new();
    for index in 0..NUM_WORDS {
        let word = source_cap.with_offset(index * WORD_SIZE);
        if index % 2 == 0 {
            // Even words: capabilities to distinct companion objects.
            let target = heap::allocate(thread, 16);
            check::cap_store(thread, word, CapPtr::from_object(target).with_offset(index)).unwrap();
            targets.push(target);
        } else {
            // Odd words: recognizable integer fill.
            let byte = u8::try_from(0x10 + index).unwrap();
            check::write_int_bytes(word, &[byte; WORD_SIZE]).unwrap();
        }
    }
    (source, targets)
}

fn assert_equivalent(original: warden_rt::ObjectRef, copy: warden_rt::ObjectRef) {
    let original_cap = CapPtr::from_object(original);
    let copy_cap = CapPtr::from_object(copy);
    for index in 0..NUM_WORDS {
        assert_eq!(
            original.word_type(index),
            copy.word_type(index),
            "word {index} type mismatch"
        );
        match original.word_type(index) {
            WordType::Ptr => {
                let a = check::cap_load(original_cap.with_offset(index * WORD_SIZE)).unwrap();
                let b = check::cap_load(copy_cap.with_offset(index * WORD_SIZE)).unwrap();
                assert_eq!(a, b, "word {index} capability mismatch");
            }
            WordType::Int => {
                let mut a = [0u8; WORD_SIZE];
                let mut b = [0u8; WORD_SIZE];
                check::read_int_bytes(original_cap.with_offset(index * WORD_SIZE), &mut a).unwrap();
                check::read_int_bytes(copy_cap.with_offset(index * WORD_SIZE), &mut b).unwrap();
                assert_eq!(a, b, "word {index} byte mismatch");
            }
            other => panic!("unexpected word type {other:?} at {index}"),
        }
    }
}

#[test]
fn memmove_round_trip_preserves_bytes_and_types() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();

    let (source, _targets) = build_mixed_source(&thread);
    let first = heap::allocate(&thread, WORD_SIZE * NUM_WORDS);
    let second = heap::allocate(&thread, WORD_SIZE * NUM_WORDS);

    bulk::memmove(
        &thread,
        CapPtr::from_object(first),
        CapPtr::from_object(source),
        WORD_SIZE * NUM_WORDS,
    )
    .unwrap();
    bulk::memmove(
        &thread,
        CapPtr::from_object(second),
        CapPtr::from_object(first),
        WORD_SIZE * NUM_WORDS,
    )
    .unwrap();

    assert_equivalent(source, first);
    assert_equivalent(source, second);
}

#[test]
fn copying_zero_words_never_forces_a_transition() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();

    // Source words are concretely Int but hold all-zero bytes; the
    // destination stays Unset after the copy.
    let source = heap::allocate_int(&thread, WORD_SIZE * 2);
    let dest = heap::allocate(&thread, WORD_SIZE * 2);

    bulk::memmove(
        &thread,
        CapPtr::from_object(dest),
        CapPtr::from_object(source),
        WORD_SIZE * 2,
    )
    .unwrap();

    assert_eq!(dest.word_type(0), WordType::Unset);
    assert_eq!(dest.word_type(1), WordType::Unset);
}

#[test]
fn misaligned_copy_cannot_carry_pointers() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();

    let target = heap::allocate(&thread, 16);
    let source = heap::allocate(&thread, WORD_SIZE * 2);
    let dest = heap::allocate(&thread, WORD_SIZE * 2);
    let source_cap = CapPtr::from_object(source);

    check::cap_store(&thread, source_cap, CapPtr::from_object(target)).unwrap();

    // Destination shifted by 8: word phases disagree, so the source must
    // check as int - which its pointer word refuses.
    let err = bulk::memmove(
        &thread,
        CapPtr::from_object(dest).with_offset(8),
        source_cap,
        WORD_SIZE,
    )
    .unwrap_err();
    assert_eq!(err.kind(), warden_rt::ViolationKind::Type);
}

#[test]
fn memset_round_trips_through_the_int_path() {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();

    let object = heap::allocate(&thread, 64);
    let cap = CapPtr::from_object(object);

    bulk::memset(&thread, cap, 0xa5, 64).unwrap();
    let mut bytes = [0u8; 64];
    check::read_int_bytes(cap, &mut bytes).unwrap();
    assert_eq!(bytes, [0xa5; 64]);

    // Zero fill over the now-int words is still the int path.
    bulk::memset(&thread, cap, 0, 64).unwrap();
    check::read_int_bytes(cap, &mut bytes).unwrap();
    assert_eq!(bytes, [0; 64]);
    assert_eq!(object.word_type(0), WordType::Int);
}
