//! Slab allocator: fixed-size slots carved from pages of a backing strategy.
//!
//! Each size class keeps a free list of `(page, slot)` pairs. Pages record
//! which of their slots are checked out in a bitmap, so a slot returned twice
//! is caught as a double free. Requests larger than the biggest class pass
//! through to the backing strategy untouched.

use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result, verify_arg};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag, SharedStrategy, StrategyId};
use crate::counter::Counter;
use crate::system::SystemAllocator;

#[derive(Debug, Clone)]
pub struct SlabConfig {
    /// Slot sizes in ascending order. Each is a power of two, at least 8 and
    /// at most `page_size`.
    pub classes: Vec<usize>,
    pub page_size: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        SlabConfig {
            classes: vec![16, 32, 64, 128, 256, 512, 1024, 2048],
            page_size: 64 * 1024,
        }
    }
}

impl SlabConfig {
    pub fn with_classes(mut self, classes: impl Into<Vec<usize>>) -> Self {
        self.classes = classes.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        verify_arg!(classes, !self.classes.is_empty());
        verify_arg!(classes, self.classes.len() <= u8::MAX as usize);
        verify_arg!(classes, self.classes.is_sorted_by(|a, b| a < b));
        verify_arg!(
            classes,
            self.classes
                .iter()
                .all(|&size| size >= 8 && size.is_power_of_two() && size <= self.page_size)
        );
        verify_arg!(page_size, self.page_size.is_power_of_two());
        Ok(())
    }
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub slot_size: usize,
    pub pages: usize,
    pub live_slots: usize,
    pub free_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabStats {
    pub classes: Vec<ClassStats>,
}

impl SlabStats {
    pub fn live_slots(&self) -> usize {
        self.classes.iter().map(|c| c.live_slots).sum()
    }

    pub fn pages(&self) -> usize {
        self.classes.iter().map(|c| c.pages).sum()
    }
}

struct SizeClass {
    slot_size: usize,
    free: Vec<(u32, u32)>,
    pages: usize,
    live: usize,
}

struct SlabPage {
    block: Block,
    class: u8,
    /// One bit per slot, set while the slot is checked out.
    checked_out: Vec<u64>,
}

impl SlabPage {
    fn is_checked_out(&self, slot: u32) -> bool {
        self.checked_out[slot as usize / 64] & (1 << (slot % 64)) != 0
    }

    fn mark(&mut self, slot: u32) {
        self.checked_out[slot as usize / 64] |= 1 << (slot % 64);
    }

    fn unmark(&mut self, slot: u32) {
        self.checked_out[slot as usize / 64] &= !(1 << (slot % 64));
    }
}

struct SlabState {
    classes: Vec<SizeClass>,
    pages: Vec<SlabPage>,
}

pub struct SlabAllocator {
    id: StrategyId,
    backing: SharedStrategy,
    config: SlabConfig,
    state: Mutex<SlabState>,
    held: Counter,
}

impl SlabAllocator {
    /// A slab allocator over the system allocator.
    pub fn new_default() -> Arc<SlabAllocator> {
        SlabAllocator::new(SystemAllocator::new())
    }

    pub fn new(backing: SharedStrategy) -> Arc<SlabAllocator> {
        Arc::new(SlabAllocator::build(backing, SlabConfig::default()))
    }

    pub fn with_config(backing: SharedStrategy, config: SlabConfig) -> Result<Arc<SlabAllocator>> {
        config.validate()?;
        Ok(Arc::new(SlabAllocator::build(backing, config)))
    }

    fn build(backing: SharedStrategy, config: SlabConfig) -> SlabAllocator {
        let classes = config
            .classes
            .iter()
            .map(|&slot_size| SizeClass {
                slot_size,
                free: Vec::new(),
                pages: 0,
                live: 0,
            })
            .collect();
        SlabAllocator {
            id: StrategyId::next(),
            backing,
            config,
            state: Mutex::new(SlabState {
                classes,
                pages: Vec::new(),
            }),
            held: Counter::default(),
        }
    }

    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    pub fn stats(&self) -> SlabStats {
        let state = self.state.lock().unwrap();
        SlabStats {
            classes: state
                .classes
                .iter()
                .map(|class| ClassStats {
                    slot_size: class.slot_size,
                    pages: class.pages,
                    live_slots: class.live,
                    free_slots: class.free.len(),
                })
                .collect(),
        }
    }

    /// Smallest class whose slots hold `size` bytes at `align`.
    fn class_for(&self, request: &AllocRequest) -> Option<usize> {
        let needed = request.size().max(request.align());
        self.config.classes.iter().position(|&size| size >= needed)
    }

    fn slots_per_page(&self, class: usize) -> u32 {
        (self.config.page_size / self.config.classes[class]) as u32
    }

    fn slot_block(&self, page: &SlabPage, page_index: u32, slot: u32, request: &AllocRequest) -> Block {
        let slot_size = self.config.classes[page.class as usize];
        // SAFETY: `slot < slots_per_page`, so the slot lies inside the page.
        let ptr = unsafe { page.block.ptr().add(slot as usize * slot_size) };
        Block::new(
            ptr,
            request.size(),
            request.align(),
            ReleaseTag::Slab {
                owner: self.id,
                class: page.class,
                page: page_index,
                slot,
            },
        )
    }

    fn take_free_slot(&self, state: &mut SlabState, class: usize, request: &AllocRequest) -> Option<Block> {
        let (page_index, slot) = state.classes[class].free.pop()?;
        state.classes[class].live += 1;
        let page = &mut state.pages[page_index as usize];
        debug_assert!(!page.is_checked_out(slot));
        page.mark(slot);
        Some(self.slot_block(page, page_index, slot, request))
    }

    fn grow(&self, class: usize, request: &AllocRequest) -> Result<Block> {
        let page_request = AllocRequest::new(self.config.page_size, self.config.classes[class], false)?;
        let block = self.backing.allocate_block(&page_request)?;
        self.held.add(block.size());
        log::debug!(
            "slab: new page of {} bytes for {}-byte slots",
            block.size(),
            self.config.classes[class]
        );

        let slots = self.slots_per_page(class);
        let mut state = self.state.lock().unwrap();
        let page_index = state.pages.len() as u32;
        let mut page = SlabPage {
            block,
            class: class as u8,
            checked_out: vec![0; (slots as usize).div_ceil(64)],
        };
        page.mark(0);
        let slot = self.slot_block(&page, page_index, 0, request);
        state.pages.push(page);
        let size_class = &mut state.classes[class];
        size_class.pages += 1;
        size_class.live += 1;
        size_class.free.extend((1..slots).rev().map(|slot| (page_index, slot)));
        Ok(slot)
    }

    fn free_slot(&self, block: &Block, class: u8, page_index: u32, slot: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(page) = state.pages.get_mut(page_index as usize) else {
            return Err(Error::foreign_block(self.name(), block.address()));
        };
        let slot_size = self.config.classes[page.class as usize];
        let expected = page.block.address() + slot as usize * slot_size;
        if page.class != class
            || slot >= self.slots_per_page(class as usize)
            || expected != block.address()
        {
            return Err(Error::foreign_block(self.name(), block.address()));
        }
        if !page.is_checked_out(slot) {
            return Err(Error::double_free(self.name(), block.address()));
        }
        page.unmark(slot);
        let size_class = &mut state.classes[class as usize];
        size_class.live -= 1;
        size_class.free.push((page_index, slot));
        Ok(())
    }
}

impl MemoryStrategy for SlabAllocator {
    fn name(&self) -> &str {
        "slab"
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        let Some(class) = self.class_for(request) else {
            let block = self.backing.allocate_block(request)?;
            self.held.add(block.size());
            return Ok(block);
        };

        let reused = {
            let mut state = self.state.lock().unwrap();
            self.take_free_slot(&mut state, class, request)
        };
        let block = match reused {
            Some(block) => block,
            None => self.grow(class, request)?,
        };
        if request.zero() {
            block.zero_prefix(request.size());
        }
        Ok(block)
    }

    fn free(&self, block: Block) -> Result<()> {
        match block.tag() {
            ReleaseTag::Slab {
                owner,
                class,
                page,
                slot,
            } if owner == self.id => self.free_slot(&block, class, page, slot),
            ReleaseTag::Slab { .. } => Err(Error::foreign_block(self.name(), block.address())),
            _ => {
                let size = block.size();
                self.backing.free(block)?;
                self.held.sub(size);
                Ok(())
            }
        }
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.held.read()
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for page in state.pages.drain(..) {
            if let Err(e) = self.backing.free(page.block) {
                log::error!("slab: failed to release page: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use memkit_common::ErrorKind;

    use super::*;
    use crate::allocator::Allocate;

    #[test]
    fn test_rounds_up_to_size_class() {
        let slab = SlabAllocator::new_default();
        let a = slab.allocate::<u8>(20, false).unwrap();
        let b = slab.allocate::<u8>(30, false).unwrap();
        assert_eq!(b.address() as usize - a.address() as usize, 32);
        let stats = slab.stats();
        assert_eq!(stats.classes[1].slot_size, 32);
        assert_eq!(stats.classes[1].live_slots, 2);
        assert_eq!(stats.classes[1].free_slots, 64 * 1024 / 32 - 2);
        assert_eq!(slab.total_allocated_bytes(), 64 * 1024);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let slab = SlabAllocator::new_default();
        let mut a = slab.allocate::<u64>(4, false).unwrap();
        a.fill(u64::MAX).unwrap();
        let address = a.address();
        a.dispose().unwrap();
        let b = slab.allocate::<u64>(4, true).unwrap();
        assert_eq!(b.address(), address);
        assert!(b.as_slice().unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_double_free_detected() {
        let slab = SlabAllocator::new_default();
        let request = AllocRequest::new(64, 8, false).unwrap();
        let block = slab.allocate_block(&request).unwrap();
        let again = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        slab.free(block).unwrap();
        let err = slab.free(again).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DoubleFree { .. }));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_large_requests_pass_through() {
        let system = SystemAllocator::new();
        let slab = SlabAllocator::new(system.clone());
        let big = slab.allocate::<u8>(4096, false).unwrap();
        assert_eq!(big.release_tag(), ReleaseTag::System);
        assert_eq!(system.total_allocated_bytes(), 4096);
        drop(big);
        assert_eq!(system.total_allocated_bytes(), 0);
        assert_eq!(slab.stats().pages(), 0);
    }

    #[test]
    fn test_pass_through_double_free_rejected() {
        let system = SystemAllocator::new();
        let slab = SlabAllocator::new(system.clone());
        let request = AllocRequest::new(8192, 8, false).unwrap();
        let block = slab.allocate_block(&request).unwrap();
        let again = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        slab.free(block).unwrap();
        let err = slab.free(again).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForeignBlock { .. }));
        assert_eq!(slab.total_allocated_bytes(), 0);
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_foreign_slab_block_rejected() {
        let slab = SlabAllocator::new_default();
        let other = SlabAllocator::new_default();
        let request = AllocRequest::new(16, 8, false).unwrap();
        let block = other.allocate_block(&request).unwrap();
        let copy = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        let err = slab.free(copy).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForeignBlock { .. }));
        other.free(block).unwrap();
    }

    #[test]
    fn test_page_exhaustion_adds_page() {
        let config = SlabConfig::default().with_classes([64]).with_page_size(256);
        let slab = SlabAllocator::with_config(SystemAllocator::new(), config).unwrap();
        let buffers = (0..5)
            .map(|_| slab.allocate::<u8>(64, false).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(slab.stats().pages(), 2);
        drop(buffers);
        let stats = slab.stats();
        assert_eq!(stats.live_slots(), 0);
        assert_eq!(stats.classes[0].free_slots, 8);
    }

    #[test]
    fn test_invalid_config() {
        let bad = SlabConfig::default().with_classes([24]);
        assert!(SlabAllocator::with_config(SystemAllocator::new(), bad).is_err());
        let unsorted = SlabConfig::default().with_classes([64, 32]);
        assert!(SlabAllocator::with_config(SystemAllocator::new(), unsorted).is_err());
    }
}
