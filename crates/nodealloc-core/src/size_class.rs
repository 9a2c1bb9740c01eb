//! Size-class arithmetic for pooled allocations.
//!
//! Pooled block sizes are multiples of an 8-byte alignment unit, from 8 up
//! to 128 bytes, giving 16 size classes. Requests above 128 bytes bypass
//! the pool entirely. `round_up` and `list_index` are the only size-class
//! arithmetic in the crate; allocate, deallocate, refill, and fragment
//! donation all go through them so a block can never land on the wrong
//! free list.

/// Alignment unit (bytes). Every pooled block size is a multiple of this.
pub const ALIGN: usize = 8;

/// Maximum pooled block size (bytes). Larger requests go to the raw allocator.
pub const MAX_BYTES: usize = 128;

/// Number of free lists, one per size class.
pub const FREE_LIST_COUNT: usize = MAX_BYTES / ALIGN;

/// Number of blocks requested from the arena per refill event.
pub const REFILL_BATCH: usize = 20;

/// Rounds `bytes` up to the nearest multiple of [`ALIGN`].
#[must_use]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Free-list index for a request of `bytes` (must be `1..=MAX_BYTES`).
///
/// Index `i` holds blocks of exactly `(i + 1) * ALIGN` bytes.
#[must_use]
pub const fn list_index(bytes: usize) -> usize {
    debug_assert!(bytes >= 1);
    (bytes + ALIGN - 1) / ALIGN - 1
}

/// Block size served by the free list at `index`.
#[must_use]
pub const fn class_size(index: usize) -> usize {
    (index + 1) * ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(9), 16);
        assert_eq!(round_up(127), 128);
        assert_eq!(round_up(128), 128);
    }

    #[test]
    fn test_list_index_bounds() {
        assert_eq!(list_index(1), 0);
        assert_eq!(list_index(8), 0);
        assert_eq!(list_index(9), 1);
        assert_eq!(list_index(16), 1);
        assert_eq!(list_index(MAX_BYTES), FREE_LIST_COUNT - 1);
    }

    #[test]
    fn test_class_size_roundtrip() {
        for index in 0..FREE_LIST_COUNT {
            let size = class_size(index);
            assert_eq!(size % ALIGN, 0);
            assert_eq!(list_index(size), index, "class {index} must map back to itself");
        }
    }

    #[test]
    fn test_round_up_and_index_agree() {
        // A request and its rounded size must resolve to the same list.
        for bytes in 1..=MAX_BYTES {
            assert_eq!(list_index(bytes), list_index(round_up(bytes)));
            assert_eq!(class_size(list_index(bytes)), round_up(bytes));
        }
    }
}
