//! Pluggable memory allocation.
//!
//! Every strategy implements [`MemoryStrategy`]; typed allocation goes through
//! [`Allocate::allocate`] and yields a [`Buffer`], which remembers the strategy
//! that issued it and releases its memory there exactly once.
//!
//! ```
//! use memkit::{Allocate, MemoryPool, MemoryStrategy, SystemAllocator};
//!
//! let pool = MemoryPool::new(SystemAllocator::new());
//! let mut buf = pool.allocate::<i32>(1000, true)?;
//! buf.set(10, 42)?;
//! buf.dispose()?;
//! assert_eq!(pool.stats().resident_blocks, 1);
//! assert_eq!(pool.total_allocated_bytes(), 4000);
//! # Ok::<(), memkit::Error>(())
//! ```

pub mod allocator;
pub mod arena;
pub mod buffer;
pub mod config;
pub mod counter;
pub mod hybrid;
pub mod large_block;
pub mod leak_tracking;
pub mod pages;
pub mod pointer;
pub mod pool;
pub mod scope;
pub mod slab;
pub mod slice;
pub mod system;

pub use allocator::{
    AllocRequest, Allocate, Block, MemoryStrategy, ReleaseTag, SharedStrategy, StrategyId,
};
pub use arena::{ArenaAllocator, ArenaConfig};
pub use buffer::Buffer;
pub use config::{StrategyKind, build_strategy};
pub use hybrid::{HybridAllocator, HybridThresholds};
pub use large_block::{LargeBlockAllocator, LargeBlockConfig};
pub use leak_tracking::{
    AllocationRecord, LEAK_REPORT_ENV, LeakReport, LeakReportMode, LeakTrackingAllocator,
    LeakTrackingBuilder,
};
pub use pages::PageAllocator;
pub use pointer::Pointer;
pub use pool::{MemoryPool, PoolConfig, PoolStats};
pub use scope::defer_dispose;
pub use slab::{ClassStats, SlabAllocator, SlabConfig, SlabStats};
pub use slice::{Slice, SliceMut};
pub use system::SystemAllocator;

pub use memkit_common::{Error, ErrorKind, Result};
pub use memkit_defer::{CleanupError, DeferScope};
