//! `PageSpan`: an owned, page-aligned region mapped from the operating system.

use std::io;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::mmap;

/// An owned run of whole pages. Unmapped on drop.
///
/// The span is zero-filled when first mapped.
pub struct PageSpan {
    ptr: NonNull<u8>,
    /// Mapped size, a multiple of the page size used for the mapping.
    capacity: usize,
    large: bool,
}

impl PageSpan {
    pub fn page_size() -> usize {
        mmap::page_size()
    }

    pub fn large_page_size() -> usize {
        mmap::large_page_size()
    }

    /// Maps at least `size` bytes of regular pages.
    pub fn allocate(size: usize) -> io::Result<PageSpan> {
        let (ptr, capacity) = mmap::map(size)?;
        log::debug!("mapped {capacity} bytes at {ptr:p}");
        Ok(PageSpan {
            ptr,
            capacity,
            large: false,
        })
    }

    /// Maps at least `size` bytes of huge pages.
    pub fn allocate_large(size: usize) -> io::Result<PageSpan> {
        let (ptr, capacity) = mmap::map_large(size)?;
        log::debug!("mapped {capacity} bytes of large pages at {ptr:p}");
        Ok(PageSpan {
            ptr,
            capacity,
            large: true,
        })
    }

    /// Tries huge pages first and falls back to regular pages.
    pub fn allocate_with_fallback(size: usize) -> io::Result<PageSpan> {
        match Self::allocate_large(size) {
            Ok(span) => Ok(span),
            Err(e) => {
                log::debug!("large pages unavailable ({e}), using regular pages");
                Self::allocate(size)
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.large
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Gives up ownership without unmapping. Rebuild with [`PageSpan::from_raw`].
    /// Returns the mapping's address, its capacity and whether it uses huge pages.
    pub fn into_raw(self) -> (NonNull<u8>, usize, bool) {
        let span = ManuallyDrop::new(self);
        (span.ptr, span.capacity, span.large)
    }

    /// Reclaims a span previously released with [`PageSpan::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr`, `capacity` and `large` must be exactly the values returned by
    /// `into_raw`, and the span must not have been reclaimed already.
    pub unsafe fn from_raw(ptr: NonNull<u8>, capacity: usize, large: bool) -> PageSpan {
        PageSpan {
            ptr,
            capacity,
            large,
        }
    }
}

impl Drop for PageSpan {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mmap::unmap(self.ptr, self.capacity) } {
            log::error!("failed to unmap {} bytes at {:p}: {e}", self.capacity, self.ptr);
        }
    }
}

// SAFETY: the span exclusively owns its mapping; access to the bytes goes
// through `&self`/`&mut self`.
unsafe impl Send for PageSpan {}

// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for PageSpan {}

impl std::fmt::Debug for PageSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSpan")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .field("large", &self.large)
            .finish()
    }
}
