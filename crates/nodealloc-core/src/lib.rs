//! # nodealloc-core
//!
//! Two-level memory allocation: a small-object pool over a raw system
//! allocator, behind one uniform byte interface.
//!
//! # Architecture
//!
//! - **System boundary** (`system`): [`SystemMemory`] over libc
//!   malloc/realloc/free, swappable in tests.
//! - **Raw allocator** (`raw`): one system attempt plus the out-of-memory
//!   handler retry protocol.
//! - **Pool** (`pool`): sixteen LIFO free lists fed by batch refills from
//!   a growable arena; large requests delegate to the raw allocator.
//! - **Size classes** (`size_class`): the 8-byte-step arithmetic shared by
//!   every path.
//! - **Typed adapter** (`typed`): element counts to byte counts, plus
//!   in-place construct/destroy.
//! - **Debug wrapper** (`debug`): per-block size verification headers.
//! - **Selection** (`select`): stateless handles, policy types with a
//!   `STATELESS` flag, and the env-configured kind dispatch.
//!
//! Byte allocators never construct or destroy values; the typed adapter
//! never touches the system heap. Containers hold whichever side of that
//! seam they need.
//!
//! ```
//! use nodealloc_core::{PoolAlloc, TypedAlloc};
//!
//! let alloc = TypedAlloc::<u64, PoolAlloc>::new(PoolAlloc);
//! let ptr = alloc.allocate(4).unwrap();
//! unsafe {
//!     alloc.construct(ptr, 7);
//!     assert_eq!(ptr.as_ptr().read(), 7);
//!     alloc.destroy(ptr);
//!     alloc.deallocate(ptr, 4);
//! }
//! ```

pub mod debug;
pub mod error;
pub mod pool;
pub mod raw;
pub mod select;
pub mod size_class;
pub mod system;
pub mod typed;

pub use debug::DebugAlloc;
pub use error::AllocError;
pub use pool::{Pool, PoolEvent, PoolLogLevel, PoolStats};
pub use raw::{OomHandler, RawAllocator};
pub use select::{
    ALLOCATOR_ENV, AdapterFor, AllocPolicy, AllocatorKind, DebugPolicy, KindAlloc, PoolAlloc,
    PoolPolicy, RawAlloc, RawPolicy, adapter,
};
pub use size_class::{ALIGN, FREE_LIST_COUNT, MAX_BYTES, REFILL_BATCH};
pub use system::{LibcMemory, SystemMemory};
pub use typed::{BytesAllocator, TypedAlloc};
