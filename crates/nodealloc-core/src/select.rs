//! Allocator selection: handles, policies, and config-time choice.
//!
//! Containers do not talk to [`Pool`](crate::pool::Pool) or
//! [`RawAllocator`](crate::raw::RawAllocator) directly. They pick an
//! allocator three ways:
//!
//! - **By type**: the stateless handles [`RawAlloc`] and [`PoolAlloc`]
//!   (zero-sized, delegating to the process-wide services) or
//!   [`DebugAlloc`] wrapping either.
//! - **By policy**: [`AllocPolicy`] maps a policy type to its concrete
//!   byte allocator plus a `STATELESS` flag, letting containers skip the
//!   allocator field entirely when it carries no per-instance state.
//! - **By configuration**: [`AllocatorKind`] is resolved once from the
//!   `NODEALLOC_ALLOCATOR` environment variable and cached; [`KindAlloc`]
//!   dispatches on it at runtime.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::debug::DebugAlloc;
use crate::error::AllocError;
use crate::pool::Pool;
use crate::raw::RawAllocator;
use crate::system::SystemMemory;
use crate::typed::{BytesAllocator, TypedAlloc};

/// Stateless handle for the process-wide raw allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawAlloc;

/// Stateless handle for the process-wide pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolAlloc;

impl BytesAllocator for RawAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Pool::global().raw().allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { Pool::global().raw().deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract.
        unsafe { Pool::global().raw().reallocate(ptr, old_size, new_size) }
    }
}

impl BytesAllocator for PoolAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Pool::global().allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { Pool::global().deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract.
        unsafe { Pool::global().reallocate(ptr, old_size, new_size) }
    }
}

/// Injected-handle form: a borrowed local pool is itself a byte allocator.
impl<S: SystemMemory> BytesAllocator for &Pool<S> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).reallocate(ptr, old_size, new_size) }
    }
}

/// Injected-handle form for a borrowed local raw allocator.
impl<S: SystemMemory> BytesAllocator for &RawAllocator<S> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).reallocate(ptr, old_size, new_size) }
    }
}

/// Compile-time mapping from an allocator choice to the concrete byte
/// allocator a container should embed (or not embed, when stateless).
pub trait AllocPolicy {
    /// Concrete byte allocator behind the adapter.
    type Bytes: BytesAllocator + Default;
    /// True when `Bytes` carries no per-instance state, so containers can
    /// materialize it on demand instead of storing it. Purely a space
    /// optimization, never a correctness requirement.
    const STATELESS: bool;
}

/// Policy selecting the raw allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawPolicy;

impl AllocPolicy for RawPolicy {
    type Bytes = RawAlloc;
    const STATELESS: bool = true;
}

/// Policy selecting the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy;

impl AllocPolicy for PoolPolicy {
    type Bytes = PoolAlloc;
    const STATELESS: bool = true;
}

/// Policy wrapping another policy's allocator in size verification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugPolicy<P: AllocPolicy = PoolPolicy>(PhantomData<P>);

impl<P: AllocPolicy> AllocPolicy for DebugPolicy<P> {
    type Bytes = DebugAlloc<P::Bytes>;
    const STATELESS: bool = P::STATELESS;
}

/// The typed adapter a policy resolves to for element type `T`.
pub type AdapterFor<P, T> = TypedAlloc<T, <P as AllocPolicy>::Bytes>;

/// Materializes the adapter for policy `P` and element type `T`.
#[must_use]
pub fn adapter<P: AllocPolicy, T>() -> AdapterFor<P, T> {
    TypedAlloc::new(P::Bytes::default())
}

/// Environment variable consulted for the config-time allocator choice.
pub const ALLOCATOR_ENV: &str = "NODEALLOC_ALLOCATOR";

const KIND_UNRESOLVED: u8 = 0;
const KIND_RAW: u8 = 1;
const KIND_POOL: u8 = 2;
const KIND_DEBUG: u8 = 3;

// Atomic cache: the environment is read once, on first use.
static CACHED_KIND: AtomicU8 = AtomicU8::new(KIND_UNRESOLVED);

/// The configurable allocator choices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Straight to the system allocator for every request.
    Raw,
    /// Pooled small blocks over the system allocator.
    #[default]
    Pool,
    /// The pool wrapped in per-block size verification.
    Debug,
}

impl AllocatorKind {
    /// Parses a kind from a string (case-insensitive, with aliases).
    /// Unknown values fall back to [`AllocatorKind::Pool`].
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "malloc" | "system" => Self::Raw,
            "pool" | "default" => Self::Pool,
            "debug" | "checked" => Self::Debug,
            _ => Self::Pool,
        }
    }

    /// The configured kind (reads [`ALLOCATOR_ENV`] on first call, caches
    /// thereafter).
    #[must_use]
    pub fn configured() -> Self {
        let cached = CACHED_KIND.load(Ordering::Relaxed);
        if cached != KIND_UNRESOLVED {
            return Self::from_u8(cached);
        }
        let resolved = match std::env::var(ALLOCATOR_ENV) {
            Ok(raw) => Self::from_str_loose(&raw),
            Err(_) => Self::Pool,
        };
        CACHED_KIND.store(resolved.to_u8(), Ordering::Relaxed);
        resolved
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Raw => KIND_RAW,
            Self::Pool => KIND_POOL,
            Self::Debug => KIND_DEBUG,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            KIND_RAW => Self::Raw,
            KIND_DEBUG => Self::Debug,
            _ => Self::Pool,
        }
    }

    /// Whether the selected allocator is stateless (true for every
    /// built-in kind; they all resolve to zero-sized handles over
    /// process-wide services).
    #[must_use]
    pub const fn stateless(self) -> bool {
        match self {
            Self::Raw | Self::Pool | Self::Debug => true,
        }
    }
}

/// Runtime-dispatch byte allocator for callers that select by
/// configuration instead of by type. The kind is fixed per instance, so
/// allocate/deallocate pairs always agree on the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindAlloc {
    kind: AllocatorKind,
}

impl KindAlloc {
    /// A dispatcher for the given kind.
    #[must_use]
    pub const fn new(kind: AllocatorKind) -> Self {
        Self { kind }
    }

    /// A dispatcher for the environment-configured kind.
    #[must_use]
    pub fn configured() -> Self {
        Self::new(AllocatorKind::configured())
    }

    /// The kind this dispatcher resolves to.
    #[must_use]
    pub const fn kind(&self) -> AllocatorKind {
        self.kind
    }
}

impl Default for KindAlloc {
    fn default() -> Self {
        Self::new(AllocatorKind::Pool)
    }
}

impl BytesAllocator for KindAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.kind {
            AllocatorKind::Raw => RawAlloc.allocate(size),
            AllocatorKind::Pool => PoolAlloc.allocate(size),
            AllocatorKind::Debug => DebugAlloc::new(PoolAlloc).allocate(size),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract; the kind is fixed, so the
        // block goes back the way it came.
        unsafe {
            match self.kind {
                AllocatorKind::Raw => RawAlloc.deallocate(ptr, size),
                AllocatorKind::Pool => PoolAlloc.deallocate(ptr, size),
                AllocatorKind::Debug => DebugAlloc::new(PoolAlloc).deallocate(ptr, size),
            }
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract.
        unsafe {
            match self.kind {
                AllocatorKind::Raw => RawAlloc.reallocate(ptr, old_size, new_size),
                AllocatorKind::Pool => PoolAlloc.reallocate(ptr, old_size, new_size),
                AllocatorKind::Debug => {
                    DebugAlloc::new(PoolAlloc).reallocate(ptr, old_size, new_size)
                }
            }
        }
    }
}
