//! `Pointer<'a, T>`: an unchecked, non-owning address into a buffer.

use std::marker::PhantomData;

use bytemuck::Pod;

/// A raw element address with index arithmetic.
///
/// The lifetime ties the pointer to the buffer it was taken from, so it cannot
/// outlive that buffer. Arithmetic is wrapping and never dereferences; reads
/// and writes are `unsafe` because they are not bounds-checked.
pub struct Pointer<'a, T> {
    ptr: *mut T,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: Pod> Pointer<'a, T> {
    pub(crate) fn new(ptr: *mut T) -> Pointer<'a, T> {
        Pointer {
            ptr,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn address(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Pointer `count` elements further on.
    #[inline]
    pub fn add(self, count: usize) -> Pointer<'a, T> {
        Pointer::new(self.ptr.wrapping_add(count))
    }

    /// Pointer `count` elements away in either direction.
    #[inline]
    pub fn offset(self, count: isize) -> Pointer<'a, T> {
        Pointer::new(self.ptr.wrapping_offset(count))
    }

    /// Distance in elements from `origin` to `self`.
    #[inline]
    pub fn distance_from(&self, origin: &Pointer<'a, T>) -> isize {
        let bytes = self.ptr as isize - origin.ptr as isize;
        bytes / std::mem::size_of::<T>().max(1) as isize
    }

    /// Reads the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must lie within the buffer this pointer was derived from.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        unsafe { self.ptr.add(index).read() }
    }

    /// Writes the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must lie within the buffer this pointer was derived from.
    #[inline]
    pub unsafe fn write(&mut self, index: usize, value: T) {
        unsafe { self.ptr.add(index).write(value) }
    }
}

impl<T> Clone for Pointer<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Pointer<'_, T> {}

impl<T> PartialEq for Pointer<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Pointer<'_, T> {}

impl<T> std::fmt::Debug for Pointer<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pointer({:p})", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::Buffer;

    #[test]
    fn test_pointer_arithmetic() {
        let mut storage = [10i32, 20, 30, 40];
        let mut buf = unsafe { Buffer::from_raw_parts_borrowed(storage.as_mut_ptr(), 4) };
        let base = buf.pointer().unwrap();
        let mut third = base.add(2);
        assert_eq!(third.distance_from(&base), 2);
        assert_eq!(third.offset(-2), base);
        unsafe {
            assert_eq!(third.read(0), 30);
            third.write(1, 41);
            assert_eq!(base.read(3), 41);
        }
    }

    #[test]
    fn test_pointer_after_dispose_fails() {
        let mut storage = [0u8; 4];
        let mut buf = unsafe { Buffer::from_raw_parts_borrowed(storage.as_mut_ptr(), 4) };
        buf.dispose().unwrap();
        assert!(buf.pointer().is_err());
    }
}
