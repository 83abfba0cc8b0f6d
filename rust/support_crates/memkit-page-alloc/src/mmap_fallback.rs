use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::io;
use std::ptr::NonNull;

/// Allocates `size` bytes (rounded up to whole emulated pages), zero-filled.
pub fn map(size: usize) -> io::Result<(NonNull<u8>, usize)> {
    map_with(size, page_size())
}

/// Emulated large pages: capacity rounds up to the large page size, alignment
/// stays at the regular page size so [`unmap`] can rebuild the layout.
pub fn map_large(size: usize) -> io::Result<(NonNull<u8>, usize)> {
    map_with(size, large_page_size())
}

fn map_with(size: usize, granularity: usize) -> io::Result<(NonNull<u8>, usize)> {
    let capacity = size
        .max(1)
        .checked_next_multiple_of(granularity)
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "mapping size overflow"))?;
    let layout = Layout::from_size_align(capacity, page_size())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    NonNull::new(ptr)
        .map(|p| (p, capacity))
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "failed to allocate pages"))
}

/// Releases a region returned by [`map`] or [`map_large`].
///
/// # Safety
///
/// `ptr` and `capacity` must come from one earlier `map`/`map_large` call and
/// the region must not be released twice.
pub unsafe fn unmap(ptr: NonNull<u8>, capacity: usize) -> io::Result<()> {
    let layout = Layout::from_size_align(capacity, page_size())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    unsafe { dealloc(ptr.as_ptr(), layout) };
    Ok(())
}

pub fn page_size() -> usize {
    4 * 1024
}

pub fn large_page_size() -> usize {
    2 * 1024 * 1024
}
