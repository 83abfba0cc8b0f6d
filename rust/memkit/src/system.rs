//! The system allocator: a thin wrapper over `std::alloc`, and the backing
//! store for every higher-level strategy.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag};
use crate::counter::Counter;

pub struct SystemAllocator {
    /// Live blocks: address -> layout they were allocated with.
    issued: Mutex<HashMap<usize, Layout>>,
    allocated: Counter,
    /// Remaining byte budget, when one is configured.
    budget: Option<Counter>,
}

impl SystemAllocator {
    pub fn new() -> Arc<SystemAllocator> {
        Arc::new(SystemAllocator {
            issued: Mutex::default(),
            allocated: Counter::default(),
            budget: None,
        })
    }

    /// A system allocator that fails with `OutOfMemory` once `limit` bytes are
    /// outstanding.
    pub fn with_budget(limit: u64) -> Arc<SystemAllocator> {
        Arc::new(SystemAllocator {
            issued: Mutex::default(),
            allocated: Counter::default(),
            budget: Some(Counter::new(limit)),
        })
    }

    /// Remaining budget, or `None` when unlimited.
    pub fn remaining_budget(&self) -> Option<u64> {
        self.budget.as_ref().map(Counter::read)
    }
}

impl MemoryStrategy for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        let layout = Layout::from_size_align(request.size(), request.align())?;
        if let Some(budget) = &self.budget {
            if !budget.withdraw(layout.size() as u64) {
                return Err(Error::out_of_memory(layout.size(), "allocation budget exhausted"));
            }
        }

        // SAFETY: `AllocRequest` guarantees a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            if let Some(budget) = &self.budget {
                budget.deposit(layout.size() as u64);
            }
            return Err(Error::out_of_memory(layout.size(), "system allocator returned null"));
        };

        let block = Block::new(ptr, layout.size(), layout.align(), ReleaseTag::System);
        if request.zero() {
            block.zero_prefix(layout.size());
        }
        self.issued.lock().unwrap().insert(block.address(), layout);
        self.allocated.add(layout.size());
        Ok(block)
    }

    fn free(&self, block: Block) -> Result<()> {
        if block.tag() != ReleaseTag::System {
            return Err(Error::foreign_block(self.name(), block.address()));
        }
        let layout = self
            .issued
            .lock()
            .unwrap()
            .remove(&block.address())
            .ok_or_else(|| Error::foreign_block(self.name(), block.address()))?;
        // SAFETY: the address was registered by `allocate_block` with this
        // layout, and removing it makes this the only deallocation.
        unsafe { std::alloc::dealloc(block.ptr().as_ptr(), layout) };
        self.allocated.sub(layout.size());
        if let Some(budget) = &self.budget {
            budget.deposit(layout.size() as u64);
        }
        Ok(())
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.allocated.read()
    }
}

#[cfg(test)]
mod tests {
    use memkit_common::ErrorKind;

    use super::*;
    use crate::allocator::Allocate;

    #[test]
    fn test_allocate_zeroed_and_free() {
        let system = SystemAllocator::new();
        let mut buf = system.allocate::<u64>(100, true).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.size_in_bytes(), 800);
        assert_eq!(buf.release_tag(), ReleaseTag::System);
        assert!(buf.as_slice().unwrap().iter().all(|&v| v == 0));
        assert_eq!(system.total_allocated_bytes(), 800);
        buf.dispose().unwrap();
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_zero_count_does_not_allocate() {
        let system = SystemAllocator::new();
        let buf = system.allocate::<u32>(0, true).unwrap();
        assert!(buf.address().is_null());
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_budget_exhaustion_is_out_of_memory() {
        let system = SystemAllocator::with_budget(1024);
        let first = system.allocate::<u8>(1000, false).unwrap();
        let err = system.allocate::<u8>(100, false).unwrap_err();
        assert!(err.is_out_of_memory());
        drop(first);
        assert_eq!(system.remaining_budget(), Some(1024));
        assert!(system.allocate::<u8>(1024, false).is_ok());
    }

    #[test]
    fn test_overflowing_count_is_rejected() {
        let system = SystemAllocator::new();
        let err = system.allocate::<u32>(usize::MAX, false).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn test_foreign_block_rejected() {
        let system = SystemAllocator::new();
        let mut word = 0u64;
        let block = Block::new(
            NonNull::from(&mut word).cast(),
            8,
            8,
            ReleaseTag::Pages,
        );
        let err = system.free(block).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForeignBlock { .. }));
    }

    #[test]
    fn test_second_free_and_unissued_address_rejected() {
        let system = SystemAllocator::new();
        let request = AllocRequest::new(64, 8, false).unwrap();
        let block = system.allocate_block(&request).unwrap();
        let again = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        system.free(block).unwrap();
        assert_eq!(system.total_allocated_bytes(), 0);
        let err = system.free(again).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForeignBlock { .. }));
        assert_eq!(system.total_allocated_bytes(), 0);

        let mut word = 0u64;
        let forged = Block::new(NonNull::from(&mut word).cast(), 8, 8, ReleaseTag::System);
        let err = system.free(forged).unwrap_err();
        assert!(err.is_contract_violation());
    }
}
