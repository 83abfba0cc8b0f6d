use bytemuck::Pod;
use memkit_defer::DeferScope;

use crate::buffer::Buffer;

/// Hands `buffer` to `scope`, which disposes it when the scope is disposed.
///
/// A release failure surfaces in the scope's `CleanupError`.
pub fn defer_dispose<'a, T: Pod>(scope: &mut DeferScope<'a>, mut buffer: Buffer<T>) {
    scope.defer(move || buffer.dispose());
}

#[cfg(test)]
mod tests {
    use memkit_defer::CleanupError;

    use super::*;
    use crate::allocator::{Allocate, MemoryStrategy};
    use crate::system::SystemAllocator;

    #[test]
    fn test_scope_disposes_buffers() {
        let system = SystemAllocator::new();
        let mut scope = DeferScope::new();
        defer_dispose(&mut scope, system.allocate::<u64>(16, false).unwrap());
        defer_dispose(&mut scope, system.allocate::<u8>(16, false).unwrap());
        assert_eq!(system.total_allocated_bytes(), 144);
        scope.dispose().unwrap();
        assert_eq!(system.total_allocated_bytes(), 0);
    }

    #[test]
    fn test_release_failure_is_reported() {
        let system = SystemAllocator::new();
        let mut word = 0u64;
        let mut scope = DeferScope::new();
        defer_dispose(&mut scope, system.allocate::<u8>(4, false).unwrap());
        let mut borrowed = unsafe { Buffer::from_raw_parts_borrowed(&mut word, 1) };
        scope.defer(move || borrowed.set(1, 3));
        match scope.dispose() {
            Err(CleanupError::Single(failure)) => assert_eq!(failure.index, 1),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(system.total_allocated_bytes(), 0);
    }
}
