//! The capability contract shared by every allocation strategy.
//!
//! A strategy hands out untyped [`Block`]s and takes them back through
//! [`MemoryStrategy::free`]. The typed entry point, [`Allocate::allocate`],
//! wraps a block into a [`Buffer`] that keeps a reference to the strategy
//! which issued it, so disposal always reaches the right free path.

use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use memkit_common::{Error, Result, verify_arg};

use crate::buffer::Buffer;

/// A strategy shared between its handle(s) and the buffers it issued.
pub type SharedStrategy = Arc<dyn MemoryStrategy>;

/// An allocation strategy.
///
/// Implementations must be safe to call from several threads at once; the
/// arena, which is single-writer by contract, still satisfies this with an
/// internal lock.
pub trait MemoryStrategy: Send + Sync + 'static {
    /// Human-readable name, used in diagnostics and error messages.
    fn name(&self) -> &str;

    /// Allocates a block of at least `request.size()` bytes aligned to
    /// `request.align()`, zero-filled when `request.zero()` is set.
    fn allocate_block(&self, request: &AllocRequest) -> Result<Block>;

    /// Takes back a block previously returned by [`MemoryStrategy::allocate_block`].
    ///
    /// Blocks this strategy did not issue are rejected with
    /// [`ErrorKind::ForeignBlock`](memkit_common::ErrorKind::ForeignBlock).
    fn free(&self, block: Block) -> Result<()>;

    /// Whether `free` releases individual blocks. When `false`, buffers skip
    /// the release call and memory is reclaimed with the strategy itself.
    fn supports_individual_deallocation(&self) -> bool;

    /// Bytes this strategy currently holds from its backing store or the
    /// platform.
    fn total_allocated_bytes(&self) -> u64;
}

/// Typed allocation on top of a strategy handle.
pub trait Allocate {
    /// Allocates a buffer of `count` elements of `T`.
    ///
    /// `count == 0` yields an empty buffer without calling the strategy.
    /// A byte size that overflows `isize::MAX` is an `InvalidArgument` error.
    #[track_caller]
    fn allocate<T: Pod>(&self, count: usize, zero: bool) -> Result<Buffer<T>>;
}

impl<S: MemoryStrategy> Allocate for Arc<S> {
    #[track_caller]
    fn allocate<T: Pod>(&self, count: usize, zero: bool) -> Result<Buffer<T>> {
        let owner: SharedStrategy = self.clone();
        allocate_typed(owner, count, zero)
    }
}

impl Allocate for SharedStrategy {
    #[track_caller]
    fn allocate<T: Pod>(&self, count: usize, zero: bool) -> Result<Buffer<T>> {
        allocate_typed(self.clone(), count, zero)
    }
}

#[track_caller]
fn allocate_typed<T: Pod>(owner: SharedStrategy, count: usize, zero: bool) -> Result<Buffer<T>> {
    if count == 0 {
        return Ok(Buffer::empty());
    }
    if std::mem::size_of::<T>() == 0 {
        return Ok(Buffer::zero_sized(count));
    }
    let request = AllocRequest::for_elements::<T>(count, zero)?;
    let block = owner.allocate_block(&request)?;
    debug_assert!(block.size() >= request.size());
    // SAFETY: the block was just issued by `owner` for `count` elements of `T`
    // with `T`'s alignment.
    Ok(unsafe { Buffer::from_block(block, count, owner) })
}

/// Parameters of one allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    size: usize,
    align: usize,
    zero: bool,
    element_size: usize,
    count: usize,
    site: &'static Location<'static>,
}

impl AllocRequest {
    /// A raw byte request. `size` must be non-zero and `align` a power of two.
    #[track_caller]
    pub fn new(size: usize, align: usize, zero: bool) -> Result<AllocRequest> {
        verify_arg!(size, size > 0);
        verify_arg!(align, align.is_power_of_two());
        verify_arg!(size, size <= isize::MAX as usize - (align - 1));
        Ok(AllocRequest {
            size,
            align,
            zero,
            element_size: 1,
            count: size,
            site: Location::caller(),
        })
    }

    /// A request for `count` elements of `T`, aligned for `T`.
    #[track_caller]
    pub fn for_elements<T: Pod>(count: usize, zero: bool) -> Result<AllocRequest> {
        let element_size = std::mem::size_of::<T>();
        let size = count
            .checked_mul(element_size)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| {
                Error::invalid_arg(
                    "count",
                    format!("{count} elements of {element_size} bytes overflow the address space"),
                )
            })?;
        let mut request = AllocRequest::new(size, std::mem::align_of::<T>(), zero)?;
        request.element_size = element_size;
        request.count = count;
        Ok(request)
    }

    /// Same request with a different byte size; used by strategies that round
    /// sizes up before asking their backing store.
    pub fn with_size(&self, size: usize) -> AllocRequest {
        AllocRequest { size, ..*self }
    }

    pub fn with_align(&self, align: usize) -> AllocRequest {
        debug_assert!(align.is_power_of_two());
        AllocRequest { align, ..*self }
    }

    pub fn with_zero(&self, zero: bool) -> AllocRequest {
        AllocRequest { zero, ..*self }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn zero(&self) -> bool {
        self.zero
    }

    /// Size of one element; 1 for raw byte requests.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of elements; equals `size()` for raw byte requests.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Source location of the `allocate` call that produced this request.
    #[inline]
    pub fn site(&self) -> &'static Location<'static> {
        self.site
    }
}

/// Identity of a strategy instance, embedded in release tags so that stacked
/// strategies of the same kind never claim each other's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrategyId(u32);

impl StrategyId {
    pub(crate) fn next() -> StrategyId {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        StrategyId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a block must be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseTag {
    /// Owned by the system allocator.
    System,
    /// A page mapping owned by the page allocator.
    Pages,
    /// Memory the buffer does not own; disposal never frees it.
    Borrowed,
    /// Carved from an arena chunk; reclaimed with the arena.
    Arena { owner: StrategyId, chunk: u32 },
    /// Returned to a pool bucket.
    Pool { owner: StrategyId, size_class: usize },
    /// Returned to a slab free list.
    Slab {
        owner: StrategyId,
        class: u8,
        page: u32,
        slot: u32,
    },
    /// A pinned managed block; reclaimed by unregistering it.
    Pinned { owner: StrategyId, id: u64 },
}

impl ReleaseTag {
    pub fn is_pinned(&self) -> bool {
        matches!(self, ReleaseTag::Pinned { .. })
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, ReleaseTag::Borrowed)
    }
}

/// An untyped run of memory issued by a strategy.
#[derive(Debug)]
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    tag: ReleaseTag,
}

impl Block {
    /// Blocks are only minted by strategies in this crate; outside code can
    /// only pass along blocks it was given.
    pub(crate) fn new(ptr: NonNull<u8>, size: usize, align: usize, tag: ReleaseTag) -> Block {
        Block {
            ptr,
            size,
            align,
            tag,
        }
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn tag(&self) -> ReleaseTag {
        self.tag
    }

    /// Zeroes the first `len` bytes of the block.
    pub(crate) fn zero_prefix(&self, len: usize) {
        debug_assert!(len <= self.size);
        // SAFETY: the block is exclusively held by the caller and spans at
        // least `len` bytes.
        unsafe { memkit_simd::zero_raw(self.ptr.as_ptr(), len) }
    }
}

// SAFETY: a block is a plain address range; ownership of the bytes travels
// with the value.
unsafe impl Send for Block {}

// SAFETY: `Block` exposes no interior mutability.
unsafe impl Sync for Block {}

#[cfg(test)]
mod tests {
    use memkit_common::ErrorKind;

    use super::*;

    #[test]
    fn test_request_for_elements() {
        let request = AllocRequest::for_elements::<u32>(10, true).unwrap();
        assert_eq!(request.size(), 40);
        assert_eq!(request.align(), 4);
        assert_eq!(request.count(), 10);
        assert_eq!(request.element_size(), 4);
        assert!(request.zero());
        assert_eq!(request.site().file(), file!());
    }

    #[test]
    fn test_request_overflow_is_contract_violation() {
        let err = AllocRequest::for_elements::<u64>(usize::MAX / 4, false).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn test_request_rejects_bad_arguments() {
        assert!(AllocRequest::new(0, 8, false).is_err());
        assert!(AllocRequest::new(16, 3, false).is_err());
        let raw = AllocRequest::new(16, 8, false).unwrap();
        assert_eq!(raw.count(), 16);
        assert_eq!(raw.element_size(), 1);
    }

    #[test]
    fn test_strategy_ids_are_unique() {
        assert_ne!(StrategyId::next(), StrategyId::next());
    }
}
