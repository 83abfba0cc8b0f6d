//! Non-owning, bounds-checked views over buffer memory.

use std::ops::RangeBounds;

use bytemuck::Pod;
use memkit_common::{Error, Result};

use crate::buffer::resolve_range;

/// A read-only, bounds-checked view.
#[derive(Clone, Copy)]
pub struct Slice<'a, T> {
    data: &'a [T],
}

impl<'a, T: Pod> Slice<'a, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.data
            .get(index)
            .copied()
            .ok_or_else(|| Error::index_out_of_bounds(index, self.data.len()))
    }

    pub fn subslice(&self, range: impl RangeBounds<usize>) -> Result<Slice<'a, T>> {
        let range = resolve_range(range, self.data.len())?;
        Ok(Slice {
            data: &self.data[range],
        })
    }

    /// The flat contiguous view.
    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        bytemuck::cast_slice(self.data)
    }

    pub fn iter(&self) -> std::slice::Iter<'a, T> {
        self.data.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.to_vec()
    }
}

impl<'a, T> From<&'a [T]> for Slice<'a, T> {
    fn from(data: &'a [T]) -> Self {
        Slice { data }
    }
}

impl<'a, T> From<Slice<'a, T>> for &'a [T] {
    fn from(slice: Slice<'a, T>) -> Self {
        slice.data
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Slice<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.data).finish()
    }
}

/// A mutable, bounds-checked view.
pub struct SliceMut<'a, T> {
    data: &'a mut [T],
}

impl<'a, T: Pod> SliceMut<'a, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.data
            .get(index)
            .copied()
            .ok_or_else(|| Error::index_out_of_bounds(index, self.data.len()))
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(index)
            .ok_or_else(|| Error::index_out_of_bounds(index, len))?;
        *slot = value;
        Ok(())
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Zeroes the view.
    pub fn clear(&mut self) {
        if std::mem::size_of::<T>() != 0 {
            memkit_simd::zero(bytemuck::cast_slice_mut(self.data));
        }
    }

    /// Copies `src` into the view; lengths must match.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(Error::invalid_arg(
                "src",
                format!("length {} does not match slice length {}", src.len(), self.data.len()),
            ));
        }
        if std::mem::size_of::<T>() != 0 {
            memkit_simd::copy(bytemuck::cast_slice_mut(self.data), bytemuck::cast_slice(src));
        }
        Ok(())
    }

    pub fn subslice_mut(&mut self, range: impl RangeBounds<usize>) -> Result<SliceMut<'_, T>> {
        let range = resolve_range(range, self.data.len())?;
        Ok(SliceMut {
            data: &mut self.data[range],
        })
    }

    /// Read-only view of the same elements.
    pub fn as_view(&self) -> Slice<'_, T> {
        Slice { data: self.data }
    }

    pub fn as_slice(&self) -> &[T] {
        self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
    }

    /// Consumes the view, returning the flat slice with the full lifetime.
    pub fn into_mut_slice(self) -> &'a mut [T] {
        self.data
    }
}

impl<'a, T> From<&'a mut [T]> for SliceMut<'a, T> {
    fn from(data: &'a mut [T]) -> Self {
        SliceMut { data }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SliceMut<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.data.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_views() {
        let data = [1u32, 2, 3, 4, 5];
        let view = Slice::from(&data[..]);
        assert_eq!(view.len(), 5);
        assert_eq!(view.get(4).unwrap(), 5);
        assert!(view.get(5).is_err());
        let inner = view.subslice(1..3).unwrap();
        assert_eq!(inner.as_slice(), &[2, 3]);
        assert!(inner.subslice(..3).is_err());
        assert_eq!(inner.as_bytes().len(), 8);
        let flat: &[u32] = inner.into();
        assert_eq!(flat, &[2, 3]);
    }

    #[test]
    fn test_slice_mut_views() {
        let mut data = [0u16; 6];
        let mut view = SliceMut::from(&mut data[..]);
        view.set(0, 9).unwrap();
        assert!(view.set(6, 1).is_err());
        {
            let mut tail = view.subslice_mut(3..).unwrap();
            tail.fill(7);
            tail.copy_from_slice(&[1, 2, 3]).unwrap();
            assert!(tail.copy_from_slice(&[1]).is_err());
        }
        assert_eq!(view.as_view().to_vec(), vec![9, 0, 0, 1, 2, 3]);
        view.clear();
        assert_eq!(view.get(0).unwrap(), 0);
        assert_eq!(view.into_mut_slice(), &[0; 6]);
    }
}
