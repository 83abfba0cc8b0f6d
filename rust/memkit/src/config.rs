//! Name-driven strategy construction for front ends and tests.

use std::fmt;
use std::str::FromStr;

use memkit_common::{Error, Result};

use crate::allocator::SharedStrategy;
use crate::arena::ArenaAllocator;
use crate::hybrid::HybridAllocator;
use crate::large_block::LargeBlockAllocator;
use crate::pages::PageAllocator;
use crate::pool::MemoryPool;
use crate::slab::SlabAllocator;
use crate::system::SystemAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    System,
    Pages,
    Arena,
    Pool,
    Slab,
    Hybrid,
    LargeBlock,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::System,
        StrategyKind::Pages,
        StrategyKind::Arena,
        StrategyKind::Pool,
        StrategyKind::Slab,
        StrategyKind::Hybrid,
        StrategyKind::LargeBlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::System => "system",
            StrategyKind::Pages => "pages",
            StrategyKind::Arena => "arena",
            StrategyKind::Pool => "pool",
            StrategyKind::Slab => "slab",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::LargeBlock => "large-block",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| Error::invalid_arg("strategy", format!("unknown strategy '{s}'")))
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a strategy of `kind` with default configuration.
///
/// `backing` feeds the composite strategies; it is ignored by `system` and
/// `pages`, which talk to the platform directly.
pub fn build_strategy(kind: StrategyKind, backing: SharedStrategy) -> SharedStrategy {
    match kind {
        StrategyKind::System => SystemAllocator::new(),
        StrategyKind::Pages => PageAllocator::new(),
        StrategyKind::Arena => ArenaAllocator::new(backing),
        StrategyKind::Pool => MemoryPool::new(backing),
        StrategyKind::Slab => SlabAllocator::new(backing),
        StrategyKind::Hybrid => HybridAllocator::new(backing),
        StrategyKind::LargeBlock => LargeBlockAllocator::new(backing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocate;

    #[test]
    fn test_parse_round_trip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!(" Pool ".parse::<StrategyKind>().unwrap(), StrategyKind::Pool);
        assert!("buddy".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_every_kind_allocates() {
        for kind in StrategyKind::ALL {
            let strategy = build_strategy(kind, SystemAllocator::new());
            let mut buf = strategy.allocate::<u32>(300, true).unwrap();
            buf.set(299, 5).unwrap();
            assert_eq!(buf.get(299).unwrap(), 5, "{kind}");
            assert_eq!(buf.get(0).unwrap(), 0, "{kind}");
            buf.dispose().unwrap();
        }
    }
}
