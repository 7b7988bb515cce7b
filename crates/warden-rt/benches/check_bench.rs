//! Access-check hot-path benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use warden_rt::check::{self, AccessKind};
use warden_rt::thread::Thread;
use warden_rt::{heap, CapPtr, WORD_SIZE};

fn bench_checks(c: &mut Criterion) {
    let thread = Thread::attach_or_current();
    let _enter = thread.enter_guard();

    let object = heap::allocate_int(&thread, 4096);
    let ptr = CapPtr::from_object(object);

    c.bench_function("check_access_int/8B", |b| {
        b.iter(|| check::check_access_int(black_box(ptr), black_box(8), AccessKind::Read).unwrap());
    });

    c.bench_function("check_access_int/4KiB", |b| {
        b.iter(|| {
            check::check_access_int(black_box(ptr), black_box(4096), AccessKind::Read).unwrap();
        });
    });

    let ptr_object = heap::allocate(&thread, WORD_SIZE * 64);
    let ptr_word = CapPtr::from_object(ptr_object);
    check::check_access_ptr(ptr_word, AccessKind::Write).unwrap();

    c.bench_function("check_access_ptr/hot", |b| {
        b.iter(|| check::check_access_ptr(black_box(ptr_word), AccessKind::Read).unwrap());
    });

    let target = heap::allocate(&thread, 16);
    let target_cap = CapPtr::from_object(target);
    c.bench_function("cap_store+load", |b| {
        b.iter(|| {
            check::cap_store(&thread, black_box(ptr_word), black_box(target_cap)).unwrap();
            black_box(check::cap_load(black_box(ptr_word)).unwrap());
        });
    });
}

criterion_group!(benches, bench_checks);
criterion_main!(benches);
