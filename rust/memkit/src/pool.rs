//! Memory pool: freed blocks are kept in size-class buckets and handed out
//! again instead of going back to the backing strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result, verify_arg};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag, SharedStrategy, StrategyId};
use crate::counter::Counter;
use crate::system::SystemAllocator;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Requested sizes are rounded up to a multiple of this to form the size
    /// class. `1` keeps exact sizes.
    pub granularity: usize,
    /// Upper bound on idle bytes kept in buckets. Blocks freed beyond it go
    /// back to the backing strategy.
    pub max_retained_bytes: Option<u64>,
    /// Requests smaller than this bypass the buckets entirely.
    pub min_block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            granularity: 1,
            max_retained_bytes: None,
            min_block_size: 0,
        }
    }
}

impl PoolConfig {
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_max_retained_bytes(mut self, max_retained_bytes: u64) -> Self {
        self.max_retained_bytes = Some(max_retained_bytes);
        self
    }

    pub fn with_min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        verify_arg!(granularity, self.granularity.is_power_of_two());
        Ok(())
    }

    fn size_class(&self, size: usize) -> Result<usize> {
        size.checked_next_multiple_of(self.granularity)
            .filter(|&class| class <= isize::MAX as usize)
            .ok_or_else(|| Error::invalid_arg("size", format!("{size} bytes overflow the size class")))
    }
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from a bucket.
    pub hits: u64,
    /// Allocations that went to the backing strategy.
    pub misses: u64,
    pub resident_blocks: usize,
    pub resident_bytes: u64,
    pub outstanding_blocks: usize,
}

/// A block handed out by the pool, as obtained from the backing strategy.
struct Issued {
    backing: Block,
    /// Bucket the block returns to; `None` for blocks that bypassed the pool.
    bucket: Option<(usize, usize)>,
}

#[derive(Default)]
struct PoolState {
    /// (size class, alignment) -> idle backing blocks.
    buckets: HashMap<(usize, usize), Vec<Block>>,
    outstanding: HashMap<usize, Issued>,
    resident_blocks: usize,
    resident_bytes: u64,
    hits: u64,
    misses: u64,
    disposed: bool,
}

impl PoolState {
    fn take_resident(&mut self) -> Vec<Block> {
        self.resident_blocks = 0;
        self.resident_bytes = 0;
        self.buckets.drain().flat_map(|(_, blocks)| blocks).collect()
    }
}

pub struct MemoryPool {
    id: StrategyId,
    name: &'static str,
    backing: SharedStrategy,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Bytes currently obtained from the backing strategy.
    held: Counter,
}

impl MemoryPool {
    /// A pool over the system allocator.
    pub fn new_default() -> Arc<MemoryPool> {
        MemoryPool::new(SystemAllocator::new())
    }

    pub fn new(backing: SharedStrategy) -> Arc<MemoryPool> {
        Arc::new(MemoryPool::build("pool", backing, PoolConfig::default()))
    }

    pub fn with_config(backing: SharedStrategy, config: PoolConfig) -> Result<Arc<MemoryPool>> {
        config.validate()?;
        Ok(Arc::new(MemoryPool::build("pool", backing, config)))
    }

    pub(crate) fn build(name: &'static str, backing: SharedStrategy, config: PoolConfig) -> MemoryPool {
        MemoryPool {
            id: StrategyId::next(),
            name,
            backing,
            config,
            state: Mutex::default(),
            held: Counter::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            hits: state.hits,
            misses: state.misses,
            resident_blocks: state.resident_blocks,
            resident_bytes: state.resident_bytes,
            outstanding_blocks: state.outstanding.len(),
        }
    }

    /// Returns every idle block to the backing strategy.
    pub fn trim(&self) -> Result<()> {
        let idle = self.state.lock().unwrap().take_resident();
        self.release_all(idle)
    }

    /// Trims the pool and stops serving allocations. Blocks still outstanding
    /// go straight back to the backing strategy when freed.
    pub fn dispose(&self) -> Result<()> {
        let idle = {
            let mut state = self.state.lock().unwrap();
            state.disposed = true;
            state.take_resident()
        };
        self.release_all(idle)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }

    fn release_all(&self, blocks: Vec<Block>) -> Result<()> {
        let mut first_error = None;
        for block in blocks {
            let size = block.size();
            match self.backing.free(block) {
                Ok(()) => self.held.sub(size),
                Err(e) => {
                    log::warn!("{}: failed to release idle block: {e}", self.name);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn issue(&self, backing: &Block, request: &AllocRequest, size_class: usize) -> Block {
        Block::new(
            backing.ptr(),
            request.size(),
            request.align(),
            ReleaseTag::Pool {
                owner: self.id,
                size_class,
            },
        )
    }
}

impl MemoryStrategy for MemoryPool {
    fn name(&self) -> &str {
        self.name
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        let pooled = request.size() >= self.config.min_block_size;
        let size_class = if pooled {
            self.config.size_class(request.size())?
        } else {
            request.size()
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return Err(Error::invalid_operation(format!("allocate on disposed {}", self.name)));
            }
            if pooled {
                let reused = state
                    .buckets
                    .get_mut(&(size_class, request.align()))
                    .and_then(Vec::pop);
                if let Some(backing) = reused {
                    state.hits += 1;
                    state.resident_blocks -= 1;
                    state.resident_bytes -= backing.size() as u64;
                    let block = self.issue(&backing, request, size_class);
                    state.outstanding.insert(
                        backing.address(),
                        Issued {
                            backing,
                            bucket: Some((size_class, request.align())),
                        },
                    );
                    drop(state);
                    if request.zero() {
                        block.zero_prefix(request.size());
                    }
                    return Ok(block);
                }
                state.misses += 1;
            }
        }

        let backing = self.backing.allocate_block(&request.with_size(size_class))?;
        self.held.add(backing.size());
        let (block, bucket) = if pooled {
            (
                self.issue(&backing, request, size_class),
                Some((size_class, request.align())),
            )
        } else {
            let block = Block::new(backing.ptr(), request.size(), request.align(), backing.tag());
            (block, None)
        };
        self.state
            .lock()
            .unwrap()
            .outstanding
            .insert(backing.address(), Issued { backing, bucket });
        Ok(block)
    }

    fn free(&self, block: Block) -> Result<()> {
        if let ReleaseTag::Pool { owner, .. } = block.tag() {
            if owner != self.id {
                return Err(Error::foreign_block(self.name, block.address()));
            }
        }

        let mut state = self.state.lock().unwrap();
        let Some(issued) = state.outstanding.remove(&block.address()) else {
            return Err(Error::foreign_block(self.name, block.address()));
        };
        let size = issued.backing.size();
        let within_cap = self
            .config
            .max_retained_bytes
            .is_none_or(|cap| state.resident_bytes + size as u64 <= cap);
        if let Some(bucket) = issued.bucket.filter(|_| !state.disposed && within_cap) {
            state.resident_blocks += 1;
            state.resident_bytes += size as u64;
            state.buckets.entry(bucket).or_default().push(issued.backing);
            return Ok(());
        }
        drop(state);

        let address = issued.backing.address();
        let copy = Block::new(
            issued.backing.ptr(),
            size,
            issued.backing.align(),
            issued.backing.tag(),
        );
        if let Err(e) = self.backing.free(copy) {
            self.state.lock().unwrap().outstanding.insert(address, issued);
            return Err(e);
        }
        self.held.sub(size);
        Ok(())
    }

    fn supports_individual_deallocation(&self) -> bool {
        true
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.held.read()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        let idle = state.take_resident();
        if !state.outstanding.is_empty() {
            log::warn!(
                "{}: dropped with {} block(s) still outstanding",
                self.name,
                state.outstanding.len()
            );
        }
        if let Err(e) = self.release_all(idle) {
            log::error!("{}: failed to release idle blocks on drop: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use memkit_common::ErrorKind;

    use super::*;
    use crate::allocator::Allocate;
    use crate::arena::ArenaAllocator;

    #[test]
    fn test_reuse_same_address_without_growth() {
        let system = SystemAllocator::new();
        let pool = MemoryPool::new(system.clone());
        let mut first = pool.allocate::<u64>(32, false).unwrap();
        let address = first.address();
        first.dispose().unwrap();
        let total = pool.total_allocated_bytes();
        assert_eq!(total, 256);

        let second = pool.allocate::<u64>(32, false).unwrap();
        assert_eq!(second.address(), address);
        assert_eq!(pool.total_allocated_bytes(), total);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.outstanding_blocks, 1);
    }

    #[test]
    fn test_reused_block_is_zeroed_on_request() {
        let pool = MemoryPool::new_default();
        let mut buf = pool.allocate::<u8>(100, false).unwrap();
        buf.fill(0xAB).unwrap();
        drop(buf);
        let buf = pool.allocate::<u8>(100, true).unwrap();
        assert!(buf.as_slice().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_granularity_shares_buckets() {
        let config = PoolConfig::default().with_granularity(64);
        let pool = MemoryPool::with_config(SystemAllocator::new(), config).unwrap();
        let a = pool.allocate::<u8>(10, false).unwrap();
        let address = a.address();
        drop(a);
        let b = pool.allocate::<u8>(60, false).unwrap();
        assert_eq!(b.address(), address);
        assert_eq!(pool.total_allocated_bytes(), 64);
    }

    #[test]
    fn test_retention_cap_returns_to_backing() {
        let system = SystemAllocator::new();
        let config = PoolConfig::default().with_max_retained_bytes(100);
        let pool = MemoryPool::with_config(system.clone(), config).unwrap();
        let a = pool.allocate::<u8>(80, false).unwrap();
        let b = pool.allocate::<u8>(80, false).unwrap();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.resident_blocks, 1);
        assert_eq!(stats.resident_bytes, 80);
        assert_eq!(system.total_allocated_bytes(), 80);
    }

    #[test]
    fn test_foreign_and_double_free() {
        let pool = MemoryPool::new_default();
        let other = MemoryPool::new_default();
        let request = AllocRequest::new(32, 8, false).unwrap();
        let block = other.allocate_block(&request).unwrap();
        let copy = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        let err = pool.free(copy).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForeignBlock { .. }));

        let mine = pool.allocate_block(&request).unwrap();
        let again = Block::new(mine.ptr(), mine.size(), mine.align(), mine.tag());
        pool.free(mine).unwrap();
        assert!(pool.free(again).is_err());
        other.free(block).unwrap();
    }

    #[test]
    fn test_trim_and_dispose() {
        let system = SystemAllocator::new();
        let pool = MemoryPool::new(system.clone());
        let live = pool.allocate::<u32>(16, false).unwrap();
        drop(pool.allocate::<u32>(8, false).unwrap());
        assert_eq!(system.total_allocated_bytes(), 96);
        pool.trim().unwrap();
        assert_eq!(system.total_allocated_bytes(), 64);

        pool.dispose().unwrap();
        let err = pool.allocate::<u32>(4, false).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
        drop(live);
        assert_eq!(system.total_allocated_bytes(), 0);
        assert_eq!(pool.stats().resident_blocks, 0);
    }

    #[test]
    fn test_failed_backing_free_keeps_block_outstanding() {
        let arena = ArenaAllocator::new_default();
        let config = PoolConfig::default().with_min_block_size(1024);
        let pool = MemoryPool::with_config(arena, config).unwrap();
        let request = AllocRequest::new(32, 8, false).unwrap();
        let block = pool.allocate_block(&request).unwrap();
        let again = Block::new(block.ptr(), block.size(), block.align(), block.tag());
        let held = pool.total_allocated_bytes();

        let err = pool.free(block).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported { .. }));
        assert_eq!(pool.stats().outstanding_blocks, 1);
        assert_eq!(pool.total_allocated_bytes(), held);

        // Still known to the pool, so a retry reaches the backing again.
        let err = pool.free(again).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported { .. }));
    }

    #[test]
    fn test_small_requests_bypass_buckets() {
        let system = SystemAllocator::new();
        let config = PoolConfig::default().with_min_block_size(1024);
        let pool = MemoryPool::with_config(system.clone(), config).unwrap();
        let small = pool.allocate::<u8>(16, false).unwrap();
        assert_eq!(small.release_tag(), ReleaseTag::System);
        drop(small);
        assert_eq!(pool.stats().resident_blocks, 0);
        assert_eq!(system.total_allocated_bytes(), 0);
    }
}
