//! Pointer-encoding tables.
//!
//! A [`PtrTable`] bijectively maps live capabilities to small dense nonzero
//! integers so capabilities can ride through integer-only interfaces while
//! staying GC-live. Encoding runs under the per-table lock; decoding is
//! lock-free against a dense array that is itself a GC-visible special
//! object - growth publishes a fresh array and the old one stays valid for
//! stale readers until the collector proves no safe point separates them
//! from it.
//!
//! An [`ExactPtrTable`] is the weaker cousin: the encoded value is always
//! the literal address, and decoding an address with no live mapping
//! yields a non-dereferenceable capability carrying that address rather
//! than failing. Its use case (opaque OS-visible handles) tolerates
//! address-only identity after death.
//!
//! Both tables self-purge slots whose object has been freed during their
//! collector marking pass, recycling the indices.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::gc::{self, MarkStack};
use crate::heap;
use crate::object::{CapWord, ObjectHeader, ObjectRef, WordType, FLAG_FREE};
use crate::ptr::CapPtr;
use crate::thread::Thread;
use crate::violation::Violation;

/// Encoded indices start above this reserved low range.
pub const PTR_TABLE_INDEX_OFFSET: usize = 64;
/// Encoded values are multiples of `1 << PTR_TABLE_SHIFT` (the word-tagging
/// granule).
pub const PTR_TABLE_SHIFT: u32 = 4;

const INITIAL_CAPACITY: usize = 10;

const fn encode_index(index: usize) -> usize {
    (index + PTR_TABLE_INDEX_OFFSET) << PTR_TABLE_SHIFT
}

const fn decode_index(encoded: usize) -> usize {
    (encoded >> PTR_TABLE_SHIFT).wrapping_sub(PTR_TABLE_INDEX_OFFSET)
}

// ============================================================================
// Dense decode array
// ============================================================================

/// The dense decode array behind a [`PtrTable`]; the payload of a
/// `PtrTableArray` special object.
pub struct PtrTableArray {
    capacity: usize,
    num_entries: AtomicUsize,
    slots: Box<[CapWord]>,
}

impl PtrTableArray {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            num_entries: AtomicUsize::new(0),
            slots: (0..capacity).map(|_| CapWord::zeroed()).collect(),
        }
    }

    fn slot(&self, index: usize) -> &CapWord {
        &self.slots[index]
    }

    fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Acquire)
    }

    /// Marks every referenced object, freed ones included: a freed header
    /// must stay readable until the purge pass nulls its slot.
    pub(crate) fn mark_entries(&self, stack: &mut MarkStack) {
        for index in 0..self.num_entries() {
            let cap = self.slot(index).load();
            if cap.addr() != 0 {
                stack.mark_opt(cap.object());
            }
        }
    }
}

fn new_array_object(capacity: usize) -> ObjectRef {
    heap::allocate_special(WordType::PtrTableArray, PtrTableArray::new(capacity))
}

// ============================================================================
// PtrTable
// ============================================================================

struct PtrTableInner {
    encode_map: HashMap<CapPtr, usize>,
    free_indices: Vec<usize>,
}

/// A bijective capability-to-index encoding table; the payload of a
/// `PtrTable` special object.
pub struct PtrTable {
    lock: Mutex<PtrTableInner>,
    /// The current `PtrTableArray` special object. Readers load it with
    /// acquire ordering and may keep using a superseded array; that is safe
    /// because superseded arrays remain GC objects until every mutator has
    /// passed a safe point.
    array: AtomicPtr<ObjectHeader>,
}

impl PtrTable {
    fn array(&self) -> (&PtrTableArray, ObjectRef) {
        let raw = self.array.load(Ordering::Acquire);
        // SAFETY: The pointer is always a live PtrTableArray special object
        // installed by create/grow.
        let object = unsafe {
            ObjectRef::from_raw(std::ptr::NonNull::new(raw).expect("table array never null"))
        };
        // SAFETY: Kind fixed at creation.
        (unsafe { object.special_payload::<PtrTableArray>() }, object)
    }

    /// Encodes a capability, returning its dense nonzero index value.
    /// Encoding a null or already-freed capability yields 0.
    pub fn encode(&self, thread: &Thread, ptr: CapPtr) -> usize {
        if ptr.addr() == 0 {
            return 0;
        }
        let Some(object) = ptr.object() else {
            return 0;
        };
        if object.has_flags(FLAG_FREE) {
            return 0;
        }

        let mut inner = self.lock.lock();
        if let Some(&index) = inner.encode_map.get(&ptr) {
            return encode_index(index);
        }

        let index = if let Some(index) = inner.free_indices.pop() {
            index
        } else {
            let (array, _) = self.array();
            if array.num_entries() >= array.capacity {
                self.grow(thread);
            }
            let (array, _) = self.array();
            array.num_entries.fetch_add(1, Ordering::Release)
        };

        let (array, _) = self.array();
        gc::store_barrier(thread, ptr.object());
        array.slot(index).store(ptr);
        inner.encode_map.insert(ptr, index);
        encode_index(index)
    }

    /// Geometric growth: allocate a new array object, copy, publish. Stale
    /// lock-free decoders keep reading the old object.
    fn grow(&self, thread: &Thread) {
        let (old, _) = self.array();
        let new_capacity = old.capacity.max(1) * 2;
        let new_object = new_array_object(new_capacity);
        // SAFETY: Kind fixed at creation.
        let new_array = unsafe { new_object.special_payload::<PtrTableArray>() };
        let live = old.num_entries();
        for index in 0..live {
            let cap = old.slot(index).load();
            gc::store_barrier(thread, cap.object());
            new_array.slot(index).store(cap);
        }
        new_array.num_entries.store(live, Ordering::Release);
        self.array
            .store(new_object.as_ptr().cast_mut(), Ordering::Release);
    }

    /// Decodes an index value. Lock-free. Out-of-range indices and slots
    /// whose capability has since been freed yield the canonical null.
    #[must_use]
    pub fn decode(&self, encoded: usize) -> CapPtr {
        let (array, _) = self.array();
        let index = decode_index(encoded);
        if index >= array.num_entries() {
            return CapPtr::forge_null();
        }
        debug_assert!(encoded != 0);
        let cap = array.slot(index).load();
        if cap.addr() == 0 {
            return CapPtr::forge_null();
        }
        let Some(object) = cap.object() else {
            return CapPtr::forge_null();
        };
        if object.has_flags(FLAG_FREE) {
            return CapPtr::forge_null();
        }
        cap
    }

    /// The collector's marking pass: keep and mark live entries, drop freed
    /// ones from the encode map, and recycle their array slots.
    ///
    /// The map and the array may transiently disagree about freed entries;
    /// that is fine, because both the encode path and the decode path
    /// reject freed objects before trusting either structure.
    pub(crate) fn mark_and_purge(&self, stack: &mut MarkStack) {
        let mut inner = self.lock.lock();

        inner.encode_map.retain(|cap, _| {
            let object = cap.object().expect("encode never admits null objects");
            if object.has_flags(FLAG_FREE) {
                return false;
            }
            stack.mark(object);
            true
        });

        let (array, array_object) = self.array();
        stack.mark(array_object);

        for index in 0..array.num_entries() {
            let cap = array.slot(index).load();
            if cap.addr() == 0 {
                continue;
            }
            let Some(object) = cap.object() else {
                continue;
            };
            if object.has_flags(FLAG_FREE) {
                inner.free_indices.push(index);
                // No barrier: storing null is not a pointer-creation event.
                array.slot(index).store(CapPtr::forge_null());
            }
        }
    }
}

/// Creates a pointer table, returning a capability to its special object.
#[must_use]
pub fn ptr_table_create(_thread: &Thread) -> CapPtr {
    let array = new_array_object(INITIAL_CAPACITY);
    let table = PtrTable {
        lock: Mutex::new(PtrTableInner {
            encode_map: HashMap::new(),
            free_indices: Vec::new(),
        }),
        array: AtomicPtr::new(array.as_ptr().cast_mut()),
    };
    CapPtr::from_object(heap::allocate_special(WordType::PtrTable, table))
}

/// Encodes `ptr` through the table behind `table_cap`.
///
/// # Errors
///
/// Fails the special access check if `table_cap` is not a pointer table.
pub fn ptr_table_encode(
    thread: &Thread,
    table_cap: CapPtr,
    ptr: CapPtr,
) -> Result<usize, Violation> {
    let table = heap::special_payload::<PtrTable>(table_cap, WordType::PtrTable)?;
    Ok(table.encode(thread, ptr))
}

/// Decodes an index value through the table behind `table_cap`.
///
/// # Errors
///
/// Fails the special access check if `table_cap` is not a pointer table.
pub fn ptr_table_decode(table_cap: CapPtr, encoded: usize) -> Result<CapPtr, Violation> {
    let table = heap::special_payload::<PtrTable>(table_cap, WordType::PtrTable)?;
    Ok(table.decode(encoded))
}

// ============================================================================
// ExactPtrTable
// ============================================================================

/// Address-keyed table whose encoded form is the literal address.
pub struct ExactPtrTable {
    /// Lock-free emptiness fast path for decode.
    count: AtomicUsize,
    decode_map: Mutex<HashMap<usize, CapPtr>>,
}

impl ExactPtrTable {
    /// Memoizes `ptr` under its address and returns the address. Null and
    /// freed capabilities are passed through without memoization.
    pub fn encode(&self, _thread: &Thread, ptr: CapPtr) -> usize {
        let Some(object) = ptr.object() else {
            return ptr.addr();
        };
        if object.has_flags(FLAG_FREE) {
            return ptr.addr();
        }
        let mut map = self.decode_map.lock();
        map.insert(ptr.addr(), ptr);
        self.count.store(map.len(), Ordering::Release);
        ptr.addr()
    }

    /// Looks up a previously-encoded address. When no live mapping exists
    /// the result is an invalid capability carrying the address - the
    /// caller keeps address identity but can never dereference it.
    #[must_use]
    pub fn decode(&self, encoded: usize) -> CapPtr {
        if self.count.load(Ordering::Acquire) == 0 {
            return CapPtr::forge_invalid(encoded);
        }
        let map = self.decode_map.lock();
        match map.get(&encoded) {
            Some(cap) => {
                debug_assert_eq!(cap.addr(), encoded);
                *cap
            }
            None => CapPtr::forge_invalid(encoded),
        }
    }

    pub(crate) fn mark_and_purge(&self, stack: &mut MarkStack) {
        let mut map = self.decode_map.lock();
        map.retain(|_, cap| {
            let Some(object) = cap.object() else {
                return false;
            };
            if object.has_flags(FLAG_FREE) {
                return false;
            }
            stack.mark(object);
            true
        });
        self.count.store(map.len(), Ordering::Release);
    }
}

/// Creates an exact pointer table, returning a capability to its special
/// object.
#[must_use]
pub fn exact_ptr_table_create(_thread: &Thread) -> CapPtr {
    let table = ExactPtrTable {
        count: AtomicUsize::new(0),
        decode_map: Mutex::new(HashMap::new()),
    };
    CapPtr::from_object(heap::allocate_special(WordType::ExactPtrTable, table))
}

/// Encodes through the table behind `table_cap`.
///
/// # Errors
///
/// Fails the special access check if `table_cap` is not an exact table.
pub fn exact_ptr_table_encode(
    thread: &Thread,
    table_cap: CapPtr,
    ptr: CapPtr,
) -> Result<usize, Violation> {
    let table = heap::special_payload::<ExactPtrTable>(table_cap, WordType::ExactPtrTable)?;
    Ok(table.encode(thread, ptr))
}

/// Decodes through the table behind `table_cap`.
///
/// # Errors
///
/// Fails the special access check if `table_cap` is not an exact table.
pub fn exact_ptr_table_decode(table_cap: CapPtr, encoded: usize) -> Result<CapPtr, Violation> {
    let table = heap::special_payload::<ExactPtrTable>(table_cap, WordType::ExactPtrTable)?;
    Ok(table.decode(encoded))
}
