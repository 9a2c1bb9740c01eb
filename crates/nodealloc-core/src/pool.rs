//! Second-level allocator: segmented free lists over a growable arena.
//!
//! Small requests (at most [`MAX_BYTES`]) are served from one of sixteen
//! LIFO free lists, one per size class. An empty list is refilled with a
//! batch of blocks carved from the arena, a contiguous span obtained from
//! the raw allocator and consumed front to back. When the arena cannot
//! cover a batch it grows by twice the request plus a sixteenth of
//! everything acquired so far, donating any leftover fragment to the free
//! list of its exact class first. Requests above [`MAX_BYTES`] delegate to
//! the raw allocator and never touch pool state.
//!
//! A free block stores its "next free" link in its first machine word;
//! while allocated the same bytes are opaque client storage. All free-list
//! and arena mutation happens under a single mutex, released on every exit
//! path including error propagation out of the growth loop.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::AllocError;
use crate::raw::RawAllocator;
use crate::size_class::{
    ALIGN, FREE_LIST_COUNT, MAX_BYTES, REFILL_BATCH, list_index, round_up,
};
use crate::system::{LibcMemory, SystemMemory};

/// Overlay interpretation of a free block: the first machine word is the
/// link to the next free block of the same class. Valid only while the
/// block is on a free list.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// A span obtained from the system, recorded so `Drop` can return it.
struct ChunkRecord {
    base: *mut u8,
    size: usize,
}

/// Severity of a [`PoolEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured record of a pool decision (refill, carve, growth, donation,
/// scavenge, exhaustion). Per-block hits and frees are counted, not
/// recorded, so the log only grows on structural events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    /// Monotonic decision id.
    pub decision_id: u64,
    /// Severity level.
    pub level: PoolLogLevel,
    /// API operation that triggered the event.
    pub op: &'static str,
    /// Event kind (`refill`, `chunk_carve`, `arena_grow`, ...).
    pub event: &'static str,
    /// Byte size involved in the event.
    pub size: Option<usize>,
    /// Size-class index involved in the event.
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
}

/// Snapshot of pool bookkeeping and counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Cumulative bytes ever obtained from the system for the arena.
    pub heap_size: usize,
    /// Unused bytes remaining in the current arena span.
    pub arena_remaining: usize,
    /// Free block count per size class.
    pub free_blocks: [usize; FREE_LIST_COUNT],
    /// Allocations served by popping a free list.
    pub pool_hits: u64,
    /// Refill events (one chunk carve each).
    pub refills: u64,
    /// Requests delegated to the raw allocator because they exceed
    /// the pooled maximum.
    pub raw_delegations: u64,
    /// Arena growth events.
    pub grow_events: u64,
    /// System-call attempts made by the embedded raw allocator.
    pub system_calls: u64,
    /// Out-of-memory failures surfaced by the embedded raw allocator.
    pub oom_events: u64,
    /// Out-of-memory handler invocations.
    pub handler_invocations: u64,
}

struct PoolState {
    free_lists: [*mut FreeNode; FREE_LIST_COUNT],
    /// First unused byte of the arena.
    start_free: *mut u8,
    /// One past the last usable byte of the arena.
    end_free: *mut u8,
    /// Cumulative bytes ever obtained from the system.
    heap_size: usize,
    chunks: Vec<ChunkRecord>,
    events: Vec<PoolEvent>,
    next_decision_id: u64,
}

// SAFETY: the raw pointers in `PoolState` refer to heap blocks owned by
// the pool and are only dereferenced while the state mutex is held.
unsafe impl Send for PoolState {}

impl PoolState {
    fn record(
        &mut self,
        level: PoolLogLevel,
        op: &'static str,
        event: &'static str,
        size: Option<usize>,
        class: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.events.push(PoolEvent {
            decision_id,
            level,
            op,
            event,
            size,
            class,
            outcome,
            details: details.into(),
        });
    }

    fn arena_remaining(&self) -> usize {
        self.end_free as usize - self.start_free as usize
    }

    fn push_free(&mut self, block: *mut u8, class: usize) {
        let node = block.cast::<FreeNode>();
        // SAFETY: every block handed to a free list is at least ALIGN bytes
        // and ALIGN-aligned, so the link write stays inside the block.
        unsafe { (*node).next = self.free_lists[class] };
        self.free_lists[class] = node;
    }
}

/// The pooling allocator service.
///
/// Free lists and arena bounds are process-wide state in this design:
/// multiple containers share one pool, so the pool is exposed as a
/// [`Pool::global`] singleton reached through the stateless
/// [`PoolAlloc`](crate::select::PoolAlloc) handle. Local instances (with
/// an injected [`SystemMemory`] backend) exist for isolated tests and
/// one-off arenas; dropping one returns every chunk it acquired, so all
/// blocks it handed out must be dead by then.
pub struct Pool<S: SystemMemory = LibcMemory> {
    raw: RawAllocator<S>,
    state: Mutex<PoolState>,
    pool_hits: AtomicU64,
    refills: AtomicU64,
    raw_delegations: AtomicU64,
    grow_events: AtomicU64,
}

static GLOBAL_POOL: Pool = Pool::new();

impl Pool<LibcMemory> {
    /// Creates a pool over the C heap.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_system(LibcMemory)
    }

    /// The process-wide pool. Lives from first use to process exit; its
    /// arena is never returned to the system.
    #[must_use]
    pub fn global() -> &'static Pool {
        &GLOBAL_POOL
    }
}

impl Default for Pool<LibcMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemMemory> Pool<S> {
    /// Creates a pool over the given backend.
    #[must_use]
    pub const fn with_system(sys: S) -> Self {
        Self {
            raw: RawAllocator::with_system(sys),
            state: Mutex::new(PoolState {
                free_lists: [ptr::null_mut(); FREE_LIST_COUNT],
                start_free: ptr::null_mut(),
                end_free: ptr::null_mut(),
                heap_size: 0,
                chunks: Vec::new(),
                events: Vec::new(),
                next_decision_id: 1,
            }),
            pool_hits: AtomicU64::new(0),
            refills: AtomicU64::new(0),
            raw_delegations: AtomicU64::new(0),
            grow_events: AtomicU64::new(0),
        }
    }

    /// The embedded first-level allocator (system wrapper + OOM handler).
    pub fn raw(&self) -> &RawAllocator<S> {
        &self.raw
    }

    /// Allocates `size` bytes. Pooled sizes pop a free list or trigger a
    /// refill; larger sizes delegate to the raw allocator. Recycled blocks
    /// are returned as-is, with no zeroing.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = size.max(1);
        if size > MAX_BYTES {
            self.raw_delegations.fetch_add(1, Ordering::Relaxed);
            return self.raw.allocate(size);
        }
        let mut state = self.state.lock();
        let class = list_index(size);
        let head = state.free_lists[class];
        if !head.is_null() {
            // SAFETY: `head` is a live free block of this class; its first
            // word holds the next link while it is on the list.
            state.free_lists[class] = unsafe { (*head).next };
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
            // SAFETY: list nodes are never null past the check above.
            return Ok(unsafe { NonNull::new_unchecked(head.cast()) });
        }
        self.refill(&mut state, round_up(size))
    }

    /// Returns a block to the pool (or the system, for large blocks).
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this pool with this exact
    /// `size`, and must not be used again. A mismatched size puts the
    /// block on the wrong free list and corrupts later allocations; the
    /// debug-wrapped allocator exists to catch exactly that.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= 1, "deallocate with zero size");
        let size = size.max(1);
        if size > MAX_BYTES {
            self.raw_delegations.fetch_add(1, Ordering::Relaxed);
            // SAFETY: forwarded caller contract.
            unsafe { self.raw.deallocate(ptr, size) };
            return;
        }
        let mut state = self.state.lock();
        state.push_free(ptr.as_ptr(), list_index(size));
    }

    /// Resizes a block. Both sizes above the pooled maximum resize through
    /// the system; sizes sharing a class return the pointer unchanged;
    /// anything else allocates, copies the surviving prefix, and frees the
    /// old block.
    ///
    /// # Safety
    /// `ptr` must have been returned by this pool with size `old_size` and
    /// not yet freed; on `Ok` with a moved block the old pointer is
    /// invalidated.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let old_size = old_size.max(1);
        let new_size = new_size.max(1);
        if old_size > MAX_BYTES && new_size > MAX_BYTES {
            self.raw_delegations.fetch_add(1, Ordering::Relaxed);
            // SAFETY: forwarded caller contract.
            return unsafe { self.raw.reallocate(ptr, old_size, new_size) };
        }
        if round_up(old_size) == round_up(new_size) {
            return Ok(ptr);
        }
        let moved = self.allocate(new_size)?;
        let copy = old_size.min(new_size);
        // SAFETY: both blocks cover at least `copy` bytes and are distinct
        // allocations, so the ranges cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), copy);
            self.deallocate(ptr, old_size);
        }
        Ok(moved)
    }

    /// Repopulates the free list for `size` (already rounded) and returns
    /// one block to the caller. Asks the arena for [`REFILL_BATCH`] blocks;
    /// whatever arrives beyond the first is threaded into the list.
    fn refill(&self, state: &mut PoolState, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut nobjs = REFILL_BATCH;
        let chunk = self.chunk_alloc(state, size, &mut nobjs)?;
        self.refills.fetch_add(1, Ordering::Relaxed);
        let class = list_index(size);
        state.record(
            PoolLogLevel::Debug,
            "allocate",
            "refill",
            Some(size),
            Some(class),
            "success",
            format!("blocks={nobjs}"),
        );
        if nobjs == 1 {
            return Ok(chunk);
        }
        let base = chunk.as_ptr();
        // SAFETY: `chunk` is the start of `nobjs * size` contiguous unused
        // bytes; block 0 goes to the caller, blocks 1..nobjs become the
        // free list with a null-terminated link chain.
        unsafe {
            let mut current = base.add(size).cast::<FreeNode>();
            state.free_lists[class] = current;
            for i in 2..nobjs {
                let next = base.add(i * size).cast::<FreeNode>();
                (*current).next = next;
                current = next;
            }
            (*current).next = ptr::null_mut();
        }
        Ok(chunk)
    }

    /// Carves `*nobjs` blocks of `size` bytes out of the arena, shrinking
    /// `*nobjs` when only part of the batch fits and growing the arena
    /// when nothing does. Written as a retry loop so fragmentation cannot
    /// recurse unboundedly.
    fn chunk_alloc(
        &self,
        state: &mut PoolState,
        size: usize,
        nobjs: &mut usize,
    ) -> Result<NonNull<u8>, AllocError> {
        'carve: loop {
            let total = size * *nobjs;
            let bytes_left = state.arena_remaining();

            if bytes_left >= total {
                let result = state.start_free;
                // SAFETY: `total` bytes past `start_free` are inside the arena.
                state.start_free = unsafe { result.add(total) };
                state.record(
                    PoolLogLevel::Trace,
                    "allocate",
                    "chunk_carve",
                    Some(total),
                    Some(list_index(size)),
                    "arena",
                    String::new(),
                );
                // SAFETY: the arena had `bytes_left >= total >= size > 0`
                // bytes, so `result` is non-null.
                return Ok(unsafe { NonNull::new_unchecked(result) });
            }

            if bytes_left >= size {
                // Partial fulfillment: hand out as many whole blocks as fit.
                *nobjs = bytes_left / size;
                let total = size * *nobjs;
                let result = state.start_free;
                // SAFETY: `total` bytes past `start_free` are inside the arena.
                state.start_free = unsafe { result.add(total) };
                state.record(
                    PoolLogLevel::Debug,
                    "allocate",
                    "chunk_partial",
                    Some(total),
                    Some(list_index(size)),
                    "arena",
                    format!("blocks={}", *nobjs),
                );
                // SAFETY: as above, the span is non-empty.
                return Ok(unsafe { NonNull::new_unchecked(result) });
            }

            // The remnant cannot hold even one block: grow. Growth is twice
            // the outstanding batch plus a sixteenth of everything acquired
            // so far, so successive requests ratchet upward with demand.
            let bytes_to_get = 2 * total + round_up(state.heap_size >> 4);

            if bytes_left > 0 {
                // Donate the remnant to the list of its exact class rather
                // than stranding it. The arena only ever holds multiples of
                // ALIGN, so the remnant maps to a class exactly.
                let class = list_index(bytes_left);
                let remnant = state.start_free;
                state.push_free(remnant, class);
                state.record(
                    PoolLogLevel::Info,
                    "allocate",
                    "fragment_donate",
                    Some(bytes_left),
                    Some(class),
                    "donated",
                    String::new(),
                );
            }

            if let Some(fresh) = self.raw.try_allocate(bytes_to_get) {
                self.install_chunk(state, fresh, bytes_to_get);
                continue 'carve;
            }

            // The system refused. Scavenge the free lists of this class and
            // larger for a spare block to repurpose as the arena before
            // running the full out-of-memory protocol.
            let mut scan = size;
            while scan <= MAX_BYTES {
                let class = list_index(scan);
                let head = state.free_lists[class];
                if !head.is_null() {
                    // SAFETY: `head` is a live free block of `scan` bytes.
                    state.free_lists[class] = unsafe { (*head).next };
                    state.start_free = head.cast();
                    // SAFETY: the block spans `scan` bytes.
                    state.end_free = unsafe { state.start_free.add(scan) };
                    state.record(
                        PoolLogLevel::Info,
                        "allocate",
                        "scavenge",
                        Some(scan),
                        Some(class),
                        "reused",
                        String::new(),
                    );
                    continue 'carve;
                }
                scan += ALIGN;
            }

            // Nothing to scavenge either. Mark the arena exhausted and let
            // the raw allocator's handler protocol decide the outcome.
            state.end_free = state.start_free;
            state.record(
                PoolLogLevel::Warn,
                "allocate",
                "arena_exhausted",
                Some(bytes_to_get),
                None,
                "fallback",
                String::new(),
            );
            let fresh = match self.raw.allocate(bytes_to_get) {
                Ok(fresh) => fresh,
                Err(err) => {
                    state.record(
                        PoolLogLevel::Error,
                        "allocate",
                        "grow_failed",
                        Some(bytes_to_get),
                        None,
                        "oom",
                        String::new(),
                    );
                    return Err(err);
                }
            };
            self.install_chunk(state, fresh, bytes_to_get);
        }
    }

    /// Adopts a fresh system chunk as the current arena span.
    fn install_chunk(&self, state: &mut PoolState, chunk: NonNull<u8>, size: usize) {
        self.grow_events.fetch_add(1, Ordering::Relaxed);
        state.chunks.push(ChunkRecord {
            base: chunk.as_ptr(),
            size,
        });
        state.heap_size += size;
        state.start_free = chunk.as_ptr();
        // SAFETY: the allocation spans `size` bytes.
        state.end_free = unsafe { chunk.as_ptr().add(size) };
        let heap_size = state.heap_size;
        state.record(
            PoolLogLevel::Info,
            "allocate",
            "arena_grow",
            Some(size),
            None,
            "system",
            format!("heap_size={heap_size}"),
        );
    }

    /// Cumulative bytes ever obtained from the system for the arena.
    pub fn heap_size(&self) -> usize {
        self.state.lock().heap_size
    }

    /// Unused bytes remaining in the current arena span.
    pub fn arena_remaining(&self) -> usize {
        self.state.lock().arena_remaining()
    }

    /// Number of blocks currently on the free list for `class`.
    pub fn free_list_len(&self, class: usize) -> usize {
        assert!(class < FREE_LIST_COUNT, "size class {class} out of range");
        let state = self.state.lock();
        let mut len = 0;
        let mut node = state.free_lists[class];
        while !node.is_null() {
            len += 1;
            // SAFETY: list nodes are live free blocks; traversal happens
            // under the state lock.
            node = unsafe { (*node).next };
        }
        len
    }

    /// Address of the head block on the free list for `class`, if any.
    /// Useful for reuse-order assertions; the pointer must not be
    /// dereferenced.
    pub fn free_list_head(&self, class: usize) -> Option<NonNull<u8>> {
        assert!(class < FREE_LIST_COUNT, "size class {class} out of range");
        NonNull::new(self.state.lock().free_lists[class].cast())
    }

    /// System-call attempts made on behalf of this pool.
    pub fn system_calls(&self) -> u64 {
        self.raw.system_calls()
    }

    /// Snapshot of bookkeeping and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut free_blocks = [0usize; FREE_LIST_COUNT];
        for (class, slot) in free_blocks.iter_mut().enumerate() {
            let mut node = state.free_lists[class];
            while !node.is_null() {
                *slot += 1;
                // SAFETY: list nodes are live free blocks; traversal happens
                // under the state lock.
                node = unsafe { (*node).next };
            }
        }
        PoolStats {
            heap_size: state.heap_size,
            arena_remaining: state.arena_remaining(),
            free_blocks,
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            refills: self.refills.load(Ordering::Relaxed),
            raw_delegations: self.raw_delegations.load(Ordering::Relaxed),
            grow_events: self.grow_events.load(Ordering::Relaxed),
            system_calls: self.raw.system_calls(),
            oom_events: self.raw.oom_events(),
            handler_invocations: self.raw.handler_invocations(),
        }
    }

    /// Copy of the structural event log.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.state.lock().events.clone()
    }

    /// Drains the structural event log.
    pub fn drain_events(&self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}

impl<S: SystemMemory> Drop for Pool<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in state.chunks.drain(..) {
            // SAFETY: each recorded chunk came from this pool's backend and
            // is exclusively owned by the pool; no block carved from it may
            // outlive the pool.
            unsafe { self.raw.system().free(chunk.base) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::class_size;

    #[test]
    fn test_fresh_pool_is_empty() {
        let pool = Pool::new();
        assert_eq!(pool.heap_size(), 0);
        assert_eq!(pool.arena_remaining(), 0);
        for class in 0..FREE_LIST_COUNT {
            assert_eq!(pool.free_list_len(class), 0);
        }
    }

    #[test]
    fn test_allocate_pooled_size() {
        let pool = Pool::new();
        let ptr = pool.allocate(24).expect("pooled allocation");
        // First refill: one block out, nineteen on the list.
        assert_eq!(pool.free_list_len(list_index(24)), REFILL_BATCH - 1);
        // SAFETY: `ptr` is a live 24-byte block.
        unsafe {
            ptr.as_ptr().write_bytes(0xEE, 24);
            pool.deallocate(ptr, 24);
        }
        assert_eq!(pool.free_list_len(list_index(24)), REFILL_BATCH);
    }

    #[test]
    fn test_zero_size_served_from_smallest_class() {
        let pool = Pool::new();
        let ptr = pool.allocate(0).expect("zero-size allocation");
        assert_eq!(pool.free_list_len(0), REFILL_BATCH - 1);
        // SAFETY: promoted to the 8-byte class.
        unsafe { pool.deallocate(ptr, 1) };
    }

    #[test]
    fn test_deallocate_feeds_exact_class() {
        let pool = Pool::new();
        let ptr = pool.allocate(40).unwrap();
        // SAFETY: live block of 40 bytes; 33..=40 all share one class.
        unsafe { pool.deallocate(ptr, 33) };
        assert_eq!(pool.free_list_len(list_index(40)), REFILL_BATCH);
    }

    #[test]
    fn test_reallocate_same_class_is_noop() {
        let pool = Pool::new();
        let ptr = pool.allocate(20).unwrap();
        // SAFETY: live block; 20 and 24 share the 24-byte class.
        let moved = unsafe { pool.reallocate(ptr, 20, 24).unwrap() };
        assert_eq!(moved, ptr);
        // SAFETY: still the same live block.
        unsafe { pool.deallocate(moved, 24) };
    }

    #[test]
    fn test_reallocate_across_classes_copies() {
        let pool = Pool::new();
        let ptr = pool.allocate(16).unwrap();
        // SAFETY: live 16-byte block, then a moved 64-byte block.
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 16);
            let moved = pool.reallocate(ptr, 16, 64).unwrap();
            assert_ne!(moved, ptr);
            assert_eq!(moved.as_ptr().read(), 0x5A);
            assert_eq!(moved.as_ptr().add(15).read(), 0x5A);
            pool.deallocate(moved, 64);
        }
    }

    #[test]
    fn test_reallocate_large_stays_on_raw_path() {
        let pool = Pool::new();
        let ptr = pool.allocate(300).unwrap();
        let before = pool.stats();
        // SAFETY: live raw block resized through the system.
        let moved = unsafe { pool.reallocate(ptr, 300, 600).unwrap() };
        let after = pool.stats();
        assert_eq!(after.heap_size, before.heap_size);
        assert_eq!(after.free_blocks, before.free_blocks);
        // SAFETY: live 600-byte raw block.
        unsafe { pool.deallocate(moved, 600) };
    }

    #[test]
    fn test_stats_snapshot_counts() {
        let pool = Pool::new();
        let a = pool.allocate(8).unwrap();
        let b = pool.allocate(8).unwrap();
        let big = pool.allocate(4096).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.refills, 1);
        assert_eq!(stats.pool_hits, 1, "second small allocation pops the list");
        assert_eq!(stats.raw_delegations, 1);
        assert_eq!(stats.grow_events, 1);
        // SAFETY: all three blocks are live and sized as recorded.
        unsafe {
            pool.deallocate(a, 8);
            pool.deallocate(b, 8);
            pool.deallocate(big, 4096);
        }
    }

    #[test]
    fn test_event_log_drains() {
        let pool = Pool::new();
        let ptr = pool.allocate(8).unwrap();
        let events = pool.drain_events();
        assert!(events.iter().any(|e| e.event == "arena_grow"));
        assert!(events.iter().any(|e| e.event == "refill"));
        assert!(events.iter().all(|e| e.decision_id > 0));
        assert!(pool.drain_events().is_empty());
        // SAFETY: live 8-byte block.
        unsafe { pool.deallocate(ptr, 8) };
    }

    #[test]
    fn test_every_class_round_trips() {
        let pool = Pool::new();
        for class in 0..FREE_LIST_COUNT {
            let size = class_size(class);
            let ptr = pool.allocate(size).unwrap();
            // SAFETY: live block of `size` bytes.
            unsafe {
                ptr.as_ptr().write_bytes(class as u8, size);
                pool.deallocate(ptr, size);
            }
        }
        for class in 0..FREE_LIST_COUNT {
            assert!(pool.free_list_len(class) >= 1, "class {class} lost its block");
        }
    }
}
