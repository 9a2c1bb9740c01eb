//! Allocation failure taxonomy.

use thiserror::Error;

/// Why an allocation request could not be satisfied.
///
/// Failures surface as explicit `Err` values, never as null pointers:
/// callers dereference allocation results unconditionally, so a silent
/// null would be unsound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system allocator refused the request and no out-of-memory
    /// handler is registered to recover.
    #[error("out of memory: system allocator refused {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes.
        requested: usize,
    },
    /// An element-count to byte-count conversion overflowed `usize`.
    #[error("allocation size overflow: {count} elements of {elem_size} bytes")]
    CapacityOverflow {
        /// Requested element count.
        count: usize,
        /// Size of one element in bytes.
        elem_size: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let oom = AllocError::OutOfMemory { requested: 4096 };
        assert!(oom.to_string().contains("4096"));

        let overflow = AllocError::CapacityOverflow {
            count: usize::MAX,
            elem_size: 8,
        };
        assert!(overflow.to_string().contains("overflow"));
    }
}
