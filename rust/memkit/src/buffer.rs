//! `Buffer<T>`: the owning, bounds-checked handle every strategy returns.

use std::ops::{Bound, Index, IndexMut, Range, RangeBounds};
use std::ptr::NonNull;

use bytemuck::Pod;
use memkit_common::{Error, Result};

use crate::allocator::{Block, ReleaseTag, SharedStrategy};
use crate::pointer::Pointer;
use crate::slice::{Slice, SliceMut};

/// A contiguous run of `len` elements of `T`, owned through the strategy that
/// issued it.
///
/// A buffer is move-only. It releases its memory exactly once: on the first
/// [`Buffer::dispose`] call or, failing that, on drop. Every accessor returns
/// [`ErrorKind::Disposed`](memkit_common::ErrorKind::Disposed) once the buffer
/// has been disposed. An empty buffer has a null [`address`](Buffer::address)
/// and its fill/clear/copy operations do nothing.
pub struct Buffer<T: Pod> {
    ptr: NonNull<T>,
    len: usize,
    align: usize,
    tag: ReleaseTag,
    /// `None` for memory the buffer does not own.
    owner: Option<SharedStrategy>,
    disposed: bool,
}

impl<T: Pod> Buffer<T> {
    /// A zero-length buffer.
    pub fn empty() -> Buffer<T> {
        Buffer::zero_sized(0)
    }

    /// A buffer of zero-sized elements, or an empty one when `len == 0`.
    pub(crate) fn zero_sized(len: usize) -> Buffer<T> {
        Buffer {
            ptr: NonNull::dangling(),
            len,
            align: std::mem::align_of::<T>(),
            tag: ReleaseTag::Borrowed,
            owner: None,
            disposed: false,
        }
    }

    /// Wraps a block issued by `owner`.
    ///
    /// # Safety
    ///
    /// `block` must have been issued by `owner`, span at least
    /// `len * size_of::<T>()` bytes and be aligned for `T`.
    pub(crate) unsafe fn from_block(block: Block, len: usize, owner: SharedStrategy) -> Buffer<T> {
        debug_assert!(block.size() >= len * std::mem::size_of::<T>());
        debug_assert!(block.address().is_multiple_of(std::mem::align_of::<T>()));
        Buffer {
            ptr: block.ptr().cast(),
            len,
            align: block.align(),
            tag: block.tag(),
            owner: Some(owner),
            disposed: false,
        }
    }

    /// Wraps memory the buffer does not own. Disposal never frees it.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` elements of `T` and
    /// properly aligned for as long as the buffer is used, and nothing else may
    /// access that memory meanwhile. `ptr` may be null only if `len == 0`.
    pub unsafe fn from_raw_parts_borrowed(ptr: *mut T, len: usize) -> Buffer<T> {
        if len == 0 {
            return Buffer::empty();
        }
        assert!(!ptr.is_null(), "non-empty borrowed buffer requires a non-null pointer");
        Buffer {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            align: std::mem::align_of::<T>(),
            tag: ReleaseTag::Borrowed,
            owner: None,
            disposed: false,
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `len() * size_of::<T>()`.
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Address of the first element; null for an empty buffer.
    #[inline]
    pub fn address(&self) -> *const T {
        if self.len == 0 {
            std::ptr::null()
        } else {
            self.ptr.as_ptr()
        }
    }

    /// How the buffer's memory is reclaimed.
    #[inline]
    pub fn release_tag(&self) -> ReleaseTag {
        self.tag
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Returns the element at `index`.
    pub fn get(&self, index: usize) -> Result<T> {
        self.check_index(index)?;
        Ok(unsafe { self.ptr.as_ptr().add(index).read() })
    }

    /// Stores `value` at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        self.check_index(index)?;
        unsafe { self.ptr.as_ptr().add(index).write(value) };
        Ok(())
    }

    pub fn as_slice(&self) -> Result<&[T]> {
        self.check_live()?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) })
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        self.check_live()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        if std::mem::size_of::<T>() == 0 {
            self.check_live()?;
            return Ok(&[]);
        }
        self.as_slice().map(bytemuck::cast_slice)
    }

    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        if std::mem::size_of::<T>() == 0 {
            self.check_live()?;
            return Ok(&mut []);
        }
        self.as_mut_slice().map(bytemuck::cast_slice_mut)
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) -> Result<()> {
        self.as_mut_slice()?.fill(value);
        Ok(())
    }

    /// Zeroes the whole buffer.
    pub fn clear(&mut self) -> Result<()> {
        memkit_simd::zero(self.as_bytes_mut()?);
        Ok(())
    }

    /// Copies `src` into the buffer. `src.len()` must equal `len()`.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        self.check_live()?;
        if src.len() != self.len {
            return Err(Error::invalid_arg(
                "src",
                format!("length {} does not match buffer length {}", src.len(), self.len),
            ));
        }
        if self.size_in_bytes() != 0 {
            memkit_simd::copy(self.as_bytes_mut()?, bytemuck::cast_slice(src));
        }
        Ok(())
    }

    /// Copies the buffer into `dst`. `dst.len()` must equal `len()`.
    pub fn copy_to(&self, dst: &mut [T]) -> Result<()> {
        self.check_live()?;
        if dst.len() != self.len {
            return Err(Error::invalid_arg(
                "dst",
                format!("length {} does not match buffer length {}", dst.len(), self.len),
            ));
        }
        if self.size_in_bytes() != 0 {
            memkit_simd::copy(bytemuck::cast_slice_mut(dst), self.as_bytes()?);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.as_slice().map(<[T]>::to_vec)
    }

    /// Unchecked pointer view over the buffer.
    pub fn pointer(&mut self) -> Result<Pointer<'_, T>> {
        self.check_live()?;
        Ok(Pointer::new(self.ptr.as_ptr()))
    }

    /// Bounds-checked read-only view of `range`.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Slice<'_, T>> {
        let range = resolve_range(range, self.len)?;
        Ok(Slice::from(&self.as_slice()?[range]))
    }

    /// Bounds-checked mutable view of `range`.
    pub fn slice_mut(&mut self, range: impl RangeBounds<usize>) -> Result<SliceMut<'_, T>> {
        let range = resolve_range(range, self.len)?;
        Ok(SliceMut::from(&mut self.as_mut_slice()?[range]))
    }

    /// Releases the buffer's memory. Calling it again is a no-op.
    ///
    /// Memory from strategies without individual deallocation (arenas) and
    /// borrowed memory is not released here.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        let Some(owner) = self.owner.take() else {
            return Ok(());
        };
        if !owner.supports_individual_deallocation() {
            return Ok(());
        }
        let block = Block::new(self.ptr.cast(), self.size_in_bytes(), self.align, self.tag);
        owner.free(block)
    }

    #[inline]
    fn check_live(&self) -> Result<()> {
        if self.disposed {
            Err(Error::disposed("buffer"))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn check_index(&self, index: usize) -> Result<()> {
        self.check_live()?;
        if index < self.len {
            Ok(())
        } else {
            Err(Error::index_out_of_bounds(index, self.len))
        }
    }
}

pub(crate) fn resolve_range(range: impl RangeBounds<usize>, len: usize) -> Result<Range<usize>> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.checked_add(1).ok_or_else(|| Error::index_out_of_bounds(s, len))?,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.checked_add(1).ok_or_else(|| Error::index_out_of_bounds(e, len))?,
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };
    if end > len {
        return Err(Error::index_out_of_bounds(end, len));
    }
    if start > end {
        return Err(Error::invalid_arg(
            "range",
            format!("start {start} is greater than end {end}"),
        ));
    }
    Ok(start..end)
}

impl<T: Pod> Drop for Buffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            log::error!("failed to release buffer at {:p}: {e}", self.ptr);
        }
    }
}

impl<T: Pod> Default for Buffer<T> {
    fn default() -> Self {
        Buffer::empty()
    }
}

impl<T: Pod> Index<usize> for Buffer<T> {
    type Output = T;

    /// # Panics
    ///
    /// Panics on an out-of-range index or a disposed buffer.
    fn index(&self, index: usize) -> &T {
        if let Err(e) = self.check_index(index) {
            panic!("{e}");
        }
        unsafe { &*self.ptr.as_ptr().add(index) }
    }
}

impl<T: Pod> IndexMut<usize> for Buffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        if let Err(e) = self.check_index(index) {
            panic!("{e}");
        }
        unsafe { &mut *self.ptr.as_ptr().add(index) }
    }
}

impl<T: Pod> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("address", &self.address())
            .field("len", &self.len)
            .field("tag", &self.tag)
            .field("owner", &self.owner.as_ref().map(|o| o.name().to_string()))
            .field("disposed", &self.disposed)
            .finish()
    }
}

// SAFETY: the buffer exclusively owns its elements; the owner handle is
// `Send + Sync`.
unsafe impl<T: Pod + Send> Send for Buffer<T> {}

// SAFETY: shared access only reads elements.
unsafe impl<T: Pod + Sync> Sync for Buffer<T> {}
