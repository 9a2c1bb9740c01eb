//! Debug-wrapped allocator: catches mismatched deallocation sizes.
//!
//! Byte allocators trust the caller-supplied size on deallocate; a wrong
//! size silently threads the block onto the wrong free list and corrupts
//! unrelated allocations much later. [`DebugAlloc`] makes that detectable:
//! every block carries a hidden header recording the allocation size plus
//! an address-derived stamp, both verified on deallocate and reallocate.
//! A mismatch panics at the faulty call site instead of corrupting state.

use std::ptr::NonNull;

use crate::error::AllocError;
use crate::typed::BytesAllocator;

/// Hidden per-block overhead: `[u64 stamp | u64 size]`. Sixteen bytes
/// keeps the user pointer on the same alignment the inner allocator
/// provides.
const HEADER: usize = 16;

/// Wrapper adding size-accounting verification to any [`BytesAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugAlloc<A: BytesAllocator> {
    inner: A,
}

impl<A: BytesAllocator> DebugAlloc<A> {
    /// Wraps the given allocator.
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    /// The wrapped allocator.
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Header stamp: an XOR-fold of the block address and size, so a
    /// stale or foreign pointer fails verification even when the size
    /// field happens to match.
    fn stamp(base: usize, size: usize) -> u64 {
        (base as u64) ^ (size as u64).rotate_left(32) ^ 0x9E37_79B9_7F4A_7C15
    }
}

impl<A: BytesAllocator> BytesAllocator for DebugAlloc<A> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.inner.allocate(size + HEADER)?;
        let base = block.as_ptr();
        // SAFETY: the first HEADER bytes of the block are reserved for the
        // header; the inner allocator returns ALIGN-aligned blocks so both
        // u64 writes are aligned.
        unsafe {
            base.cast::<u64>().write(Self::stamp(base as usize, size));
            base.add(8).cast::<u64>().write(size as u64);
            Ok(NonNull::new_unchecked(base.add(HEADER)))
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: `ptr` came from `allocate` above, so the header sits
        // HEADER bytes below it and the full block is `size + HEADER` bytes.
        unsafe {
            let base = ptr.as_ptr().sub(HEADER);
            let stamp = base.cast::<u64>().read();
            let recorded = base.add(8).cast::<u64>().read() as usize;
            assert_eq!(
                recorded, size,
                "deallocate size mismatch: block carries {recorded} bytes, caller claimed {size}"
            );
            assert_eq!(
                stamp,
                Self::stamp(base as usize, recorded),
                "allocation header corrupted at {base:p}"
            );
            self.inner
                .deallocate(NonNull::new_unchecked(base), size + HEADER);
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: same layout argument as `deallocate`; after the inner
        // resize the header is rewritten for the new base and size.
        unsafe {
            let base = ptr.as_ptr().sub(HEADER);
            let recorded = base.add(8).cast::<u64>().read() as usize;
            assert_eq!(
                recorded, old_size,
                "reallocate size mismatch: block carries {recorded} bytes, caller claimed {old_size}"
            );
            let moved = self.inner.reallocate(
                NonNull::new_unchecked(base),
                old_size + HEADER,
                new_size + HEADER,
            )?;
            let new_base = moved.as_ptr();
            new_base
                .cast::<u64>()
                .write(Self::stamp(new_base as usize, new_size));
            new_base.add(8).cast::<u64>().write(new_size as u64);
            Ok(NonNull::new_unchecked(new_base.add(HEADER)))
        }
    }
}
