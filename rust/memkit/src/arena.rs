//! Arena allocator: bump allocation from chunks of a backing strategy.
//!
//! Individual blocks are never freed. Buffers from an arena hold the arena
//! alive, and all chunks go back to the backing strategy together when the
//! last handle (arena or buffer) is dropped.

use std::sync::{Arc, Mutex};

use memkit_common::{Error, Result, verify_arg};

use crate::allocator::{AllocRequest, Block, MemoryStrategy, ReleaseTag, SharedStrategy, StrategyId};
use crate::system::SystemAllocator;

/// Minimum chunk alignment; keeps every chunk start suitable for any `Pod`
/// element up to 16-byte alignment.
const CHUNK_ALIGN: usize = 16;

#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Size of a regular chunk. Requests larger than this get a dedicated
    /// chunk of their own.
    pub chunk_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            chunk_size: 64 * 1024,
        }
    }
}

impl ArenaConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        verify_arg!(chunk_size, self.chunk_size >= CHUNK_ALIGN);
        Ok(())
    }
}

pub struct ArenaAllocator {
    id: StrategyId,
    backing: SharedStrategy,
    config: ArenaConfig,
    state: Mutex<ArenaState>,
}

#[derive(Default)]
struct ArenaState {
    chunks: Vec<Block>,
    /// Index of the chunk currently bumped from.
    current: Option<usize>,
    /// Offset of the first free byte in the current chunk.
    cursor: usize,
    /// Bytes handed out, including alignment padding.
    used: usize,
}

impl ArenaState {
    /// Carves `request` from the current chunk, if it fits.
    fn bump(&mut self, request: &AllocRequest) -> Option<(usize, usize)> {
        let index = self.current?;
        let chunk = &self.chunks[index];
        let start = (chunk.address() + self.cursor).checked_next_multiple_of(request.align())?;
        let offset = start - chunk.address();
        let end = offset.checked_add(request.size())?;
        if end > chunk.size() {
            return None;
        }
        self.used += end - self.cursor;
        self.cursor = end;
        Some((index, offset))
    }
}

impl ArenaAllocator {
    /// An arena over the system allocator.
    pub fn new_default() -> Arc<ArenaAllocator> {
        ArenaAllocator::new(SystemAllocator::new())
    }

    pub fn new(backing: SharedStrategy) -> Arc<ArenaAllocator> {
        Arc::new(ArenaAllocator {
            id: StrategyId::next(),
            backing,
            config: ArenaConfig::default(),
            state: Mutex::default(),
        })
    }

    pub fn with_config(backing: SharedStrategy, config: ArenaConfig) -> Result<Arc<ArenaAllocator>> {
        config.validate()?;
        Ok(Arc::new(ArenaAllocator {
            id: StrategyId::next(),
            backing,
            config,
            state: Mutex::default(),
        }))
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    /// Bytes carved from chunks so far, alignment padding included.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().unwrap().used
    }

    fn carve(&self, chunks: &[Block], index: usize, offset: usize, request: &AllocRequest) -> Block {
        let chunk = &chunks[index];
        // SAFETY: `offset + size` lies within the chunk, checked by the caller.
        let ptr = unsafe { chunk.ptr().add(offset) };
        let block = Block::new(
            ptr,
            request.size(),
            request.align(),
            ReleaseTag::Arena {
                owner: self.id,
                chunk: index as u32,
            },
        );
        if request.zero() {
            block.zero_prefix(request.size());
        }
        block
    }
}

impl MemoryStrategy for ArenaAllocator {
    fn name(&self) -> &str {
        "arena"
    }

    fn allocate_block(&self, request: &AllocRequest) -> Result<Block> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some((index, offset)) = state.bump(request) {
                return Ok(self.carve(&state.chunks, index, offset, request));
            }
        }

        // Oversize requests get a chunk of their own and leave the current
        // bump chunk in place.
        let oversize = request.size() > self.config.chunk_size;
        let chunk_request = AllocRequest::new(
            request.size().max(self.config.chunk_size),
            request.align().max(CHUNK_ALIGN),
            false,
        )?;
        let chunk = self.backing.allocate_block(&chunk_request)?;
        log::debug!(
            "arena: acquired {} chunk of {} bytes from '{}'",
            if oversize { "dedicated" } else { "regular" },
            chunk.size(),
            self.backing.name()
        );

        let mut state = self.state.lock().unwrap();
        let index = state.chunks.len();
        if u32::try_from(index).is_err() {
            drop(state);
            self.backing.free(chunk)?;
            return Err(Error::out_of_memory(request.size(), "arena chunk limit reached"));
        }
        state.chunks.push(chunk);
        state.used += request.size();
        if !oversize {
            state.current = Some(index);
            state.cursor = request.size();
        }
        Ok(self.carve(&state.chunks, index, 0, request))
    }

    fn free(&self, _block: Block) -> Result<()> {
        Err(Error::unsupported(self.name(), "individual deallocation"))
    }

    fn supports_individual_deallocation(&self) -> bool {
        false
    }

    fn total_allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .chunks
            .iter()
            .map(|chunk| chunk.size() as u64)
            .sum()
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut().unwrap_or_else(|e| e.into_inner()));
        let count = state.chunks.len();
        for chunk in state.chunks {
            if let Err(e) = self.backing.free(chunk) {
                log::error!("arena: failed to release chunk: {e}");
            }
        }
        if count > 0 {
            log::debug!("arena: released {count} chunk(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use memkit_common::ErrorKind;

    use super::*;
    use crate::allocator::Allocate;

    #[test]
    fn test_bump_allocations_share_a_chunk() {
        let system = SystemAllocator::new();
        let arena = ArenaAllocator::new(system.clone());
        let a = arena.allocate::<u32>(10, true).unwrap();
        let b = arena.allocate::<u64>(10, false).unwrap();
        assert_eq!(arena.chunk_count(), 1);
        assert!((b.address() as usize).is_multiple_of(8));
        assert!(b.address() as usize >= a.address() as usize + 40);
        assert!(a.as_slice().unwrap().iter().all(|&v| v == 0));
        assert_eq!(system.total_allocated_bytes(), 64 * 1024);
    }

    #[test]
    fn test_new_chunk_when_current_is_full() {
        let config = ArenaConfig::default().with_chunk_size(256);
        let arena = ArenaAllocator::with_config(SystemAllocator::new(), config).unwrap();
        let _a = arena.allocate::<u8>(200, false).unwrap();
        let _b = arena.allocate::<u8>(100, false).unwrap();
        assert_eq!(arena.chunk_count(), 2);
        assert_eq!(arena.total_allocated_bytes(), 512);
    }

    #[test]
    fn test_oversize_request_keeps_current_chunk() {
        let config = ArenaConfig::default().with_chunk_size(256);
        let arena = ArenaAllocator::with_config(SystemAllocator::new(), config).unwrap();
        let a = arena.allocate::<u8>(16, false).unwrap();
        let big = arena.allocate::<u8>(1000, true).unwrap();
        let c = arena.allocate::<u8>(16, false).unwrap();
        assert_eq!(arena.chunk_count(), 2);
        assert_eq!(big.len(), 1000);
        assert_eq!(c.address() as usize, a.address() as usize + 16);
    }

    #[test]
    fn test_free_is_unsupported_and_dispose_is_noop() {
        let system = SystemAllocator::new();
        let arena = ArenaAllocator::new(system.clone());
        let mut buf = arena.allocate::<u16>(8, false).unwrap();
        assert!(!arena.supports_individual_deallocation());
        buf.dispose().unwrap();
        assert!(buf.is_disposed());

        let block = arena.allocate_block(&AllocRequest::new(8, 8, false).unwrap()).unwrap();
        let err = arena.free(block).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported { .. }));
    }

    #[test]
    fn test_chunks_released_with_last_handle() {
        let system = SystemAllocator::new();
        let arena = ArenaAllocator::new(system.clone());
        let buf = arena.allocate::<u8>(100, false).unwrap();
        drop(arena);
        assert_eq!(system.total_allocated_bytes(), 64 * 1024);
        drop(buf);
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_invalid_chunk_size() {
        let config = ArenaConfig::default().with_chunk_size(0);
        assert!(ArenaAllocator::with_config(SystemAllocator::new(), config).is_err());
    }
}
