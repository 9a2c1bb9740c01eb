//! System heap boundary.
//!
//! Everything below the pool talks to the process heap through
//! [`SystemMemory`], so tests can swap in backends that fail on demand or
//! count calls. The production backend is [`LibcMemory`], a direct wrapper
//! over `malloc`/`realloc`/`free`.

/// Raw access to the process heap.
///
/// Implementations report failure by returning null; they never panic on
/// exhaustion. That keeps the out-of-memory protocol in one place (the raw
/// allocator's retry loop) instead of scattering it across backends.
pub trait SystemMemory: Send + Sync {
    /// Requests `size` bytes. Returns null on failure.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Resizes an allocation obtained from this backend. Returns null on
    /// failure, in which case `ptr` is still valid.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc` or `realloc` on this
    /// backend and not yet freed.
    unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8;

    /// Releases an allocation obtained from this backend.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc` or `realloc` on this
    /// backend and not yet freed.
    unsafe fn free(&self, ptr: *mut u8);
}

/// Production backend: the C allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LibcMemory;

impl SystemMemory for LibcMemory {
    fn alloc(&self, size: usize) -> *mut u8 {
        // SAFETY: direct call to the libc allocator; failure is a null return.
        unsafe { libc::malloc(size).cast() }
    }

    unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        // SAFETY: caller guarantees `ptr` came from this backend.
        unsafe { libc::realloc(ptr.cast(), new_size).cast() }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: caller guarantees `ptr` came from this backend.
        unsafe { libc::free(ptr.cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_libc_round_trip() {
        let sys = LibcMemory;
        let ptr = sys.alloc(64);
        assert!(!ptr.is_null());
        // SAFETY: freshly allocated 64-byte block.
        unsafe {
            ptr.write_bytes(0xA5, 64);
            assert_eq!(ptr.read(), 0xA5);
            sys.free(ptr);
        }
    }

    #[test]
    fn test_libc_realloc_preserves_prefix() {
        let sys = LibcMemory;
        let ptr = sys.alloc(16);
        assert!(!ptr.is_null());
        // SAFETY: `ptr` is a live 16-byte block from `sys`.
        unsafe {
            ptr.write_bytes(0x3C, 16);
            let grown = sys.realloc(ptr, 256);
            assert!(!grown.is_null());
            assert_eq!(grown.read(), 0x3C);
            assert_eq!(grown.add(15).read(), 0x3C);
            sys.free(grown);
        }
    }
}
