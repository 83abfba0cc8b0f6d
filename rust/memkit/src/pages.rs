//! Page allocator: every block is its own OS mapping.
//!
//! Mapping and unmapping are system calls, which is what the large-block pool
//! exists to amortize. Pages arrive zero-filled from the kernel, so zero
//! requests cost nothing extra.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result};
use memkit_page_alloc::PageSpan;

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag};
use crate::counter::Counter;

pub struct PageAllocator {
    prefer_large_pages: bool,
    /// Live mappings: address -> (mapped capacity, huge pages). Large-page
    /// attempts may fall back to regular pages, so neither can be recomputed
    /// on free.
    mappings: Mutex<HashMap<usize, (usize, bool)>>,
    /// Mapped bytes (whole pages).
    mapped: Counter,
}

impl PageAllocator {
    pub fn new() -> Arc<PageAllocator> {
        Arc::new(PageAllocator {
            prefer_large_pages: false,
            mappings: Mutex::default(),
            mapped: Counter::default(),
        })
    }

    /// Tries huge pages first for every mapping, falling back to regular pages.
    pub fn with_large_pages() -> Arc<PageAllocator> {
        Arc::new(PageAllocator {
            prefer_large_pages: true,
            mappings: Mutex::default(),
            mapped: Counter::default(),
        })
    }

    pub fn page_size() -> usize {
        PageSpan::page_size()
    }
}

impl MemoryStrategy for PageAllocator {
    fn name(&self) -> &str {
        "pages"
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        if request.align() > PageSpan::page_size() {
            return Err(Error::invalid_arg(
                "align",
                format!(
                    "alignment {} exceeds the page size {}",
                    request.align(),
                    PageSpan::page_size()
                ),
            ));
        }
        let span = if self.prefer_large_pages {
            PageSpan::allocate_with_fallback(request.size())
        } else {
            PageSpan::allocate(request.size())
        }
        .map_err(|e| Error::out_of_memory(request.size(), e.to_string()))?;

        let (ptr, capacity, large) = span.into_raw();
        self.mappings
            .lock()
            .unwrap()
            .insert(ptr.as_ptr() as usize, (capacity, large));
        self.mapped.add(capacity);
        Ok(Block::new(ptr, request.size(), request.align(), ReleaseTag::Pages))
    }

    fn free(&self, block: Block) -> Result<()> {
        if block.tag() != ReleaseTag::Pages {
            return Err(Error::foreign_block(self.name(), block.address()));
        }
        let (capacity, large) = self
            .mappings
            .lock()
            .unwrap()
            .remove(&block.address())
            .ok_or_else(|| Error::foreign_block(self.name(), block.address()))?;
        // SAFETY: the address was registered by `allocate_block` together with
        // the values `into_raw` returned, and removing it makes this the only
        // reclaim.
        let span = unsafe { PageSpan::from_raw(block.ptr(), capacity, large) };
        drop(span);
        self.mapped.sub(capacity);
        Ok(())
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.mapped.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocate;

    #[test]
    fn test_page_allocation_is_page_aligned_and_zeroed() {
        let pages = PageAllocator::new();
        let buf = pages.allocate::<u32>(5000, true).unwrap();
        assert_eq!(buf.release_tag(), ReleaseTag::Pages);
        assert!((buf.address() as usize).is_multiple_of(PageAllocator::page_size()));
        assert!(buf.as_slice().unwrap().iter().all(|&v| v == 0));
        assert_eq!(
            pages.total_allocated_bytes(),
            20_000usize.next_multiple_of(PageAllocator::page_size()) as u64
        );
        drop(buf);
        assert_eq!(pages.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_large_page_preference_falls_back() {
        let pages = PageAllocator::with_large_pages();
        let mut buf = pages.allocate::<u8>(100, false).unwrap();
        buf.fill(3).unwrap();
        assert!(pages.total_allocated_bytes() >= PageAllocator::page_size() as u64);
        buf.dispose().unwrap();
        assert_eq!(pages.total_allocated_bytes(), 0);
    }
}
