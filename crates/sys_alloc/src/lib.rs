//! Low-level OS memory primitives.
//!
//! This crate wraps anonymous `mmap` with a small owned-handle API. The
//! runtime uses it for mmap-backed heap objects and for large raw scratch
//! regions whose lifetime is managed by the collector rather than by Rust
//! destructors (see [`Mmap::into_raw`]).

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

pub use os::page_size;

/// A handle to an anonymous memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Releases ownership of the mapping without unmapping it.
    ///
    /// Returns the base pointer and length. The caller becomes responsible
    /// for eventually reconstructing the handle with [`Mmap::from_raw`] (or
    /// leaking the region for the life of the process).
    #[must_use]
    pub fn into_raw(self) -> (*mut u8, usize) {
        self.inner.into_raw()
    }

    /// Reconstructs a mapping handle from [`Mmap::into_raw`] output.
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must describe a live anonymous mapping previously
    /// released with `into_raw`, and no other handle may own it.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        // SAFETY: Caller guarantees exclusive ownership of the mapping.
        let inner = unsafe { os::MmapInner::from_raw(ptr, len) };
        Self { inner }
    }
}

// SAFETY: The mapping is plain anonymous memory with no thread affinity.
unsafe impl Send for Mmap {}
// SAFETY: See Send impl; interior access goes through raw pointers only.
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled memory map.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping cannot be created, or
    /// `InvalidInput` for a zero length.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = os::MmapInner::map_anon(self.len, self.populate, self.no_reserve)?;
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{page_size, Mmap, MmapOptions};
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = MmapOptions::new().len(len).map_anon().expect("failed to map");

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_map_is_zeroed() {
        let len = page_size() * 2;
        let mmap = MmapOptions::new().len(len).map_anon().expect("failed to map");
        let base = mmap.ptr();
        for offset in (0..len).step_by(512) {
            unsafe {
                assert_eq!(ptr::read_volatile(base.add(offset)), 0);
            }
        }
    }

    #[test]
    fn test_into_raw_round_trip() {
        let len = page_size();
        let mmap = MmapOptions::new().len(len).map_anon().expect("failed to map");
        let (ptr, raw_len) = mmap.into_raw();
        assert_eq!(raw_len, len);

        unsafe {
            ptr::write_volatile(ptr, 7);
        }

        let restored = unsafe { Mmap::from_raw(ptr, raw_len) };
        assert_eq!(unsafe { ptr::read_volatile(restored.ptr()) }, 7);
    }
}
