//! Large-block allocator: a page-granular pool for big, size-stable buffers.

use std::sync::Arc;

use memkit_common::{Result, verify_arg};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, SharedStrategy};
use crate::pages::PageAllocator;
use crate::pool::{MemoryPool, PoolConfig, PoolStats};

#[derive(Debug, Clone)]
pub struct LargeBlockConfig {
    /// Sizes round up to a multiple of this, so near sizes share a bucket.
    pub granularity: usize,
    pub max_retained_bytes: u64,
    /// Requests below this go straight to the backing strategy.
    pub min_block_size: usize,
}

impl Default for LargeBlockConfig {
    fn default() -> Self {
        LargeBlockConfig {
            granularity: PageAllocator::page_size(),
            max_retained_bytes: 256 * 1024 * 1024,
            min_block_size: 64 * 1024,
        }
    }
}

impl LargeBlockConfig {
    pub fn with_max_retained_bytes(mut self, max_retained_bytes: u64) -> Self {
        self.max_retained_bytes = max_retained_bytes;
        self
    }

    pub fn with_min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        verify_arg!(granularity, self.granularity.is_power_of_two());
        Ok(())
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_granularity(self.granularity)
            .with_max_retained_bytes(self.max_retained_bytes)
            .with_min_block_size(self.min_block_size)
    }
}

pub struct LargeBlockAllocator {
    pool: MemoryPool,
    config: LargeBlockConfig,
}

impl LargeBlockAllocator {
    /// A large-block allocator over fresh page mappings.
    pub fn new_default() -> Arc<LargeBlockAllocator> {
        LargeBlockAllocator::new(PageAllocator::new())
    }

    pub fn new(backing: SharedStrategy) -> Arc<LargeBlockAllocator> {
        let config = LargeBlockConfig::default();
        Arc::new(LargeBlockAllocator {
            pool: MemoryPool::build("large-block", backing, config.pool_config()),
            config,
        })
    }

    pub fn with_config(
        backing: SharedStrategy,
        config: LargeBlockConfig,
    ) -> Result<Arc<LargeBlockAllocator>> {
        config.validate()?;
        Ok(Arc::new(LargeBlockAllocator {
            pool: MemoryPool::build("large-block", backing, config.pool_config()),
            config,
        }))
    }

    pub fn config(&self) -> &LargeBlockConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn trim(&self) -> Result<()> {
        self.pool.trim()
    }

    pub fn dispose(&self) -> Result<()> {
        self.pool.dispose()
    }
}

impl MemoryStrategy for LargeBlockAllocator {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        self.pool.allocate_block(request)
    }

    fn free(&self, block: Block) -> Result<()> {
        self.pool.free(block)
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.pool.total_allocated_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Allocate, ReleaseTag};
    use crate::system::SystemAllocator;

    #[test]
    fn test_near_sizes_share_a_mapping() {
        let large = LargeBlockAllocator::new_default();
        let page = PageAllocator::page_size();
        let a = large.allocate::<u8>(16 * page + 10, false).unwrap();
        let address = a.address();
        drop(a);
        let b = large.allocate::<u8>(16 * page + 100, true).unwrap();
        assert_eq!(b.address(), address);
        assert!(b.as_slice().unwrap().iter().all(|&v| v == 0));
        assert_eq!(large.stats().hits, 1);
        assert_eq!(large.total_allocated_bytes(), (17 * page) as u64);
    }

    #[test]
    fn test_small_requests_are_not_pooled() {
        let system = SystemAllocator::new();
        let large = LargeBlockAllocator::new(system.clone());
        let small = large.allocate::<u8>(1024, false).unwrap();
        assert_eq!(small.release_tag(), ReleaseTag::System);
        drop(small);
        assert_eq!(large.stats().resident_blocks, 0);
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_retention_cap() {
        let system = SystemAllocator::new();
        let config = LargeBlockConfig::default()
            .with_granularity(4096)
            .with_min_block_size(4096)
            .with_max_retained_bytes(8192);
        let large = LargeBlockAllocator::with_config(system.clone(), config).unwrap();
        let buffers = (0..3)
            .map(|_| large.allocate::<u8>(4096, false).unwrap())
            .collect::<Vec<_>>();
        drop(buffers);
        assert_eq!(large.stats().resident_bytes, 8192);
        assert_eq!(system.total_allocated_bytes(), 8192);
        large.dispose().unwrap();
        assert_eq!(system.total_allocated_bytes(), 0);
    }
}
