/// Allocates payload storage for outgoing blocks.
///
/// Returning `None` is an allocation failure: the fragment is lost and the
/// next block is flagged discontinuous.
pub trait BlockAllocator: Send + Sync {
    /// An empty buffer able to hold exactly `len` bytes.
    fn allocate(&self, len: usize) -> Option<Vec<u8>>;
}

/// Heap allocator that reports failure instead of aborting.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl BlockAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).ok()?;
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocation() {
        let buf = HeapAllocator.allocate(4096).unwrap();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn impossible_allocation_fails() {
        assert!(HeapAllocator.allocate(usize::MAX).is_none());
    }
}
