//! First-level allocator: a thin wrapper over the system heap with an
//! out-of-memory recovery hook.
//!
//! [`RawAllocator`] makes one system attempt per request. On failure it
//! enters a retry loop: as long as a handler is registered, invoke it
//! (the handler is expected to release memory or terminate the process)
//! and retry the system call. With no handler the failure surfaces as
//! [`AllocError::OutOfMemory`]. The handler slot is swapped atomically so
//! callers can stack handlers and restore the previous one.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::system::{LibcMemory, SystemMemory};

/// Process-wide recovery callback invoked when the system allocator fails.
///
/// A handler must either release memory so the retried system call can
/// succeed, or panic/abort; a handler that does neither spins the retry
/// loop forever. Handlers must not allocate from a pool that is mid-growth
/// (the pool's state lock is held across growth and is not reentrant).
pub type OomHandler = fn();

/// Thin wrapper over a [`SystemMemory`] backend with the out-of-memory
/// retry protocol and diagnostic counters.
///
/// This is an explicit service rather than a bag of statics: the
/// process-wide instance lives inside the global pool (see
/// [`Pool::global`](crate::pool::Pool::global)), and tests construct local
/// instances with injected backends.
pub struct RawAllocator<S: SystemMemory = LibcMemory> {
    sys: S,
    oom_handler: Mutex<Option<OomHandler>>,
    system_calls: AtomicU64,
    oom_events: AtomicU64,
    handler_invocations: AtomicU64,
}

impl RawAllocator<LibcMemory> {
    /// Creates an allocator over the C heap.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_system(LibcMemory)
    }
}

impl Default for RawAllocator<LibcMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemMemory> RawAllocator<S> {
    /// Creates an allocator over the given backend.
    #[must_use]
    pub const fn with_system(sys: S) -> Self {
        Self {
            sys,
            oom_handler: Mutex::new(None),
            system_calls: AtomicU64::new(0),
            oom_events: AtomicU64::new(0),
            handler_invocations: AtomicU64::new(0),
        }
    }

    /// The underlying system backend.
    pub fn system(&self) -> &S {
        &self.sys
    }

    /// Requests `size` bytes from the system, running the handler retry
    /// loop on failure. Zero-size requests are promoted to one byte.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = size.max(1);
        if let Some(ptr) = self.try_allocate(size) {
            return Ok(ptr);
        }
        self.retry_with_handler(size)
    }

    /// Single system attempt without the handler protocol.
    ///
    /// The pool's growth path uses this so it can try its free-list
    /// scavenging fallback before committing to the full protocol.
    pub fn try_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.system_calls.fetch_add(1, Ordering::Relaxed);
        NonNull::new(self.sys.alloc(size.max(1)))
    }

    fn retry_with_handler(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        loop {
            // Re-read the slot each iteration: the handler may deregister
            // itself or install a successor.
            let handler = *self.oom_handler.lock();
            let Some(handler) = handler else {
                self.oom_events.fetch_add(1, Ordering::Relaxed);
                return Err(AllocError::OutOfMemory { requested: size });
            };
            self.handler_invocations.fetch_add(1, Ordering::Relaxed);
            handler();
            self.system_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(ptr) = NonNull::new(self.sys.alloc(size)) {
                return Ok(ptr);
            }
        }
    }

    /// Releases a block back to the system. `_size` is accepted for
    /// interface symmetry; the system allocator does not need it.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not yet freed.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.sys.free(ptr.as_ptr()) }
    }

    /// Resizes a block, with the same retry-on-failure protocol as
    /// [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not yet freed;
    /// on `Ok` the old pointer is invalidated.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let new_size = new_size.max(1);
        self.system_calls.fetch_add(1, Ordering::Relaxed);
        // SAFETY: forwarded caller contract.
        if let Some(moved) = NonNull::new(unsafe { self.sys.realloc(ptr.as_ptr(), new_size) }) {
            return Ok(moved);
        }
        loop {
            let handler = *self.oom_handler.lock();
            let Some(handler) = handler else {
                self.oom_events.fetch_add(1, Ordering::Relaxed);
                return Err(AllocError::OutOfMemory {
                    requested: new_size,
                });
            };
            self.handler_invocations.fetch_add(1, Ordering::Relaxed);
            handler();
            self.system_calls.fetch_add(1, Ordering::Relaxed);
            // SAFETY: a failed realloc leaves `ptr` valid, so retrying is sound.
            if let Some(moved) = NonNull::new(unsafe { self.sys.realloc(ptr.as_ptr(), new_size) })
            {
                return Ok(moved);
            }
        }
    }

    /// Swaps the out-of-memory handler, returning the previous one so a
    /// caller can restore it later.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        std::mem::replace(&mut *self.oom_handler.lock(), handler)
    }

    /// Total system-call attempts (successful or not).
    pub fn system_calls(&self) -> u64 {
        self.system_calls.load(Ordering::Relaxed)
    }

    /// Failures surfaced as [`AllocError::OutOfMemory`].
    pub fn oom_events(&self) -> u64 {
        self.oom_events.load(Ordering::Relaxed)
    }

    /// Times the registered handler has been invoked.
    pub fn handler_invocations(&self) -> u64 {
        self.handler_invocations.load(Ordering::Relaxed)
    }
}
