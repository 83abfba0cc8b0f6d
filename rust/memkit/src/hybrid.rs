//! Hybrid allocator: small element counts live in pinned heap blocks owned by
//! the allocator, larger ones go to a backing strategy.
//!
//! The cut-off depends on the element size, see [`HybridThresholds`].

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag, SharedStrategy, StrategyId};
use crate::counter::Counter;
use crate::system::SystemAllocator;

/// Element counts below which an allocation is served from a pinned block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridThresholds {
    /// 1-byte elements.
    pub byte: usize,
    /// 4-byte elements.
    pub word: usize,
    /// 8-byte elements.
    pub double_word: usize,
    /// Every other element size.
    pub general: usize,
}

impl Default for HybridThresholds {
    fn default() -> Self {
        HybridThresholds {
            byte: 1024,
            word: 256,
            double_word: 128,
            general: 64,
        }
    }
}

impl HybridThresholds {
    pub fn for_element_size(&self, element_size: usize) -> usize {
        match element_size {
            1 => self.byte,
            4 => self.word,
            8 => self.double_word,
            _ => self.general,
        }
    }

    pub fn with_byte(mut self, byte: usize) -> Self {
        self.byte = byte;
        self
    }

    pub fn with_word(mut self, word: usize) -> Self {
        self.word = word;
        self
    }

    pub fn with_double_word(mut self, double_word: usize) -> Self {
        self.double_word = double_word;
        self
    }

    pub fn with_general(mut self, general: usize) -> Self {
        self.general = general;
        self
    }
}

/// Unit of pinned storage; its alignment is the strongest a pinned block
/// offers.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct PinnedChunk([u8; PINNED_ALIGN]);

const PINNED_ALIGN: usize = 64;

/// A leaked `Box<[PinnedChunk]>`, reclaimed on unregister.
struct PinnedBlock {
    ptr: NonNull<PinnedChunk>,
    chunks: usize,
}

impl PinnedBlock {
    fn new(size: usize) -> PinnedBlock {
        let chunks = size.div_ceil(PINNED_ALIGN);
        let boxed = vec![PinnedChunk([0; PINNED_ALIGN]); chunks].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<PinnedChunk>();
        PinnedBlock { ptr, chunks }
    }

    fn size(&self) -> usize {
        self.chunks * PINNED_ALIGN
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.chunks);
        // SAFETY: `ptr` and `chunks` describe the slice leaked in `new`, and
        // each `PinnedBlock` is dropped once.
        drop(unsafe { Box::from_raw(slice) });
    }
}

// SAFETY: `PinnedBlock` uniquely owns its heap slice.
unsafe impl Send for PinnedBlock {}

pub struct HybridAllocator {
    id: StrategyId,
    backing: SharedStrategy,
    thresholds: HybridThresholds,
    pinned: Mutex<HashMap<u64, PinnedBlock>>,
    next_pin: AtomicU64,
    pinned_bytes: Counter,
    backing_bytes: Counter,
}

impl HybridAllocator {
    /// A hybrid allocator over the system allocator.
    pub fn new_default() -> Arc<HybridAllocator> {
        HybridAllocator::new(SystemAllocator::new())
    }

    pub fn new(backing: SharedStrategy) -> Arc<HybridAllocator> {
        HybridAllocator::with_config(backing, HybridThresholds::default())
    }

    pub fn with_config(backing: SharedStrategy, thresholds: HybridThresholds) -> Arc<HybridAllocator> {
        Arc::new(HybridAllocator {
            id: StrategyId::next(),
            backing,
            thresholds,
            pinned: Mutex::default(),
            next_pin: AtomicU64::new(1),
            pinned_bytes: Counter::default(),
            backing_bytes: Counter::default(),
        })
    }

    pub fn thresholds(&self) -> &HybridThresholds {
        &self.thresholds
    }

    /// Number of registered pinned blocks.
    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().unwrap().len()
    }

    pub fn pinned_bytes(&self) -> u64 {
        self.pinned_bytes.read()
    }

    fn is_pinned_request(&self, request: &AllocRequest) -> bool {
        request.align() <= PINNED_ALIGN
            && request.count() < self.thresholds.for_element_size(request.element_size())
    }

    fn allocate_pinned(&self, request: &AllocRequest) -> Block {
        let pinned = PinnedBlock::new(request.size());
        let id = self.next_pin.fetch_add(1, Ordering::Relaxed);
        let block = Block::new(
            pinned.ptr.cast(),
            request.size(),
            request.align(),
            ReleaseTag::Pinned { owner: self.id, id },
        );
        self.pinned_bytes.add(pinned.size());
        self.pinned.lock().unwrap().insert(id, pinned);
        block
    }

    fn unpin(&self, block: &Block, id: u64) -> Result<()> {
        let mut pinned = self.pinned.lock().unwrap();
        match pinned.get(&id) {
            None => return Err(Error::double_free(self.name(), block.address())),
            Some(registered) if registered.ptr.as_ptr() as usize != block.address() => {
                return Err(Error::foreign_block(self.name(), block.address()));
            }
            Some(_) => {}
        }
        if let Some(registered) = pinned.remove(&id) {
            self.pinned_bytes.sub(registered.size());
        }
        Ok(())
    }
}

impl MemoryStrategy for HybridAllocator {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        if self.is_pinned_request(request) {
            // Pinned blocks come zero-filled.
            return Ok(self.allocate_pinned(request));
        }
        let block = self.backing.allocate_block(request)?;
        self.backing_bytes.add(block.size());
        Ok(block)
    }

    fn free(&self, block: Block) -> Result<()> {
        match block.tag() {
            ReleaseTag::Pinned { owner, id } if owner == self.id => self.unpin(&block, id),
            ReleaseTag::Pinned { .. } => Err(Error::foreign_block(self.name(), block.address())),
            _ => {
                let size = block.size();
                self.backing.free(block)?;
                self.backing_bytes.sub(size);
                Ok(())
            }
        }
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.pinned_bytes.read() + self.backing_bytes.read()
    }
}
