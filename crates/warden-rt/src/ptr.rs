//! The capability fat pointer.
//!
//! A [`CapPtr`] pairs an object reference with the raw integer address it
//! currently denotes. The address may be computed out of bounds transiently;
//! only dereferencing is checked. A capability with a null object reference
//! can still carry a raw integer ("boxed int") for arithmetic-only use and
//! is never dereferenceable.

use std::fmt;

use crate::object::{free_singleton, ObjectHeader, ObjectRef};

/// A capability: object identity plus current address.
///
/// Equality and hashing are structural (object identity and address), which
/// is what the encoding tables key on. For raw ordering comparisons in user
/// code, compare [`CapPtr::addr`] values directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapPtr {
    object: *const ObjectHeader,
    addr: usize,
}

// SAFETY: A capability is two plain words; every dereference goes through
// the access checks, and object lifetime is the collector's problem.
unsafe impl Send for CapPtr {}
// SAFETY: See Send impl.
unsafe impl Sync for CapPtr {}

impl CapPtr {
    /// The all-null capability.
    #[must_use]
    pub const fn forge_null() -> Self {
        Self {
            object: std::ptr::null(),
            addr: 0,
        }
    }

    /// A boxed integer: a raw value carried in the address with no object.
    /// Never dereferenceable.
    #[must_use]
    pub const fn forge_int(value: usize) -> Self {
        Self {
            object: std::ptr::null(),
            addr: value,
        }
    }

    /// A capability carrying `addr` but targeting the free singleton, so
    /// that every access traps while the numeric address stays observable.
    #[must_use]
    pub fn forge_invalid(addr: usize) -> Self {
        Self {
            object: free_singleton().as_ptr(),
            addr,
        }
    }

    /// A capability at the base of `object`.
    #[must_use]
    pub fn from_object(object: ObjectRef) -> Self {
        Self {
            object: object.as_ptr(),
            addr: object.lower() as usize,
        }
    }

    /// Reassembles a capability from its stored halves.
    #[must_use]
    pub const fn from_parts(object: *const ObjectHeader, addr: usize) -> Self {
        Self { object, addr }
    }

    /// The same capability redirected to `addr`. Bounds are not checked;
    /// only dereference checks care.
    #[must_use]
    pub const fn with_addr(self, addr: usize) -> Self {
        Self {
            object: self.object,
            addr,
        }
    }

    /// The same capability advanced by `offset` bytes (wrapping).
    #[must_use]
    pub const fn with_offset(self, offset: usize) -> Self {
        Self {
            object: self.object,
            addr: self.addr.wrapping_add(offset),
        }
    }

    /// The object reference, if any.
    #[inline]
    #[must_use]
    pub fn object(self) -> Option<ObjectRef> {
        std::ptr::NonNull::new(self.object.cast_mut())
            // SAFETY: A non-null object half always points at a live header.
            .map(|ptr| unsafe { ObjectRef::from_raw(ptr) })
    }

    /// The raw object half, for storage into a capability word.
    #[inline]
    #[must_use]
    pub(crate) const fn object_raw(self) -> *const ObjectHeader {
        self.object
    }

    /// The raw address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.addr
    }

    /// Whether both halves are null.
    #[inline]
    #[must_use]
    pub fn is_totally_null(self) -> bool {
        self.object.is_null() && self.addr == 0
    }

    /// Offset of the address from the object's lower bound.
    ///
    /// Meaningful only for in-bounds capabilities; wraps otherwise.
    #[inline]
    #[must_use]
    pub fn offset(self) -> usize {
        self.object().map_or(self.addr, |object| {
            self.addr.wrapping_sub(object.lower() as usize)
        })
    }

    /// Bytes remaining between the address and the object's upper bound.
    /// Zero when there is no object or the address is at/past the end.
    #[inline]
    #[must_use]
    pub fn available(self) -> usize {
        self.object().map_or(0, |object| {
            (object.upper() as usize).saturating_sub(self.addr)
        })
    }

    /// Renders the capability for diagnostics.
    #[must_use]
    pub fn dump(self) -> String {
        match self.object() {
            None if self.addr == 0 => "null".to_string(),
            None => format!("boxed-int {:#x}", self.addr),
            Some(object) => format!("{:#x} of {}", self.addr, object.dump()),
        }
    }
}

impl fmt::Debug for CapPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

impl Default for CapPtr {
    fn default() -> Self {
        Self::forge_null()
    }
}

#[cfg(test)]
mod tests {
    use super::CapPtr;
    use crate::object::free_singleton;

    #[test]
    fn test_null_capability() {
        let null = CapPtr::forge_null();
        assert!(null.is_totally_null());
        assert!(null.object().is_none());
        assert_eq!(null.addr(), 0);
        assert_eq!(null.available(), 0);
    }

    #[test]
    fn test_boxed_int_carries_value() {
        let boxed = CapPtr::forge_int(0xdead_beef);
        assert!(boxed.object().is_none());
        assert_eq!(boxed.addr(), 0xdead_beef);
        assert!(!boxed.is_totally_null());
    }

    #[test]
    fn test_forge_invalid_targets_free_singleton() {
        let invalid = CapPtr::forge_invalid(0x1000);
        assert_eq!(invalid.addr(), 0x1000);
        assert_eq!(invalid.object(), Some(free_singleton()));
        assert_eq!(invalid.available(), 0);
    }

    #[test]
    fn test_offset_arithmetic() {
        let base = CapPtr::forge_int(100);
        assert_eq!(base.with_offset(28).addr(), 128);
        assert_eq!(base.with_addr(7).addr(), 7);
    }
}
