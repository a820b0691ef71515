//! Secure-id keyed shared memory registry.
//!
//! The GPU, the display controller and client processes all name a shared
//! allocation by its [`SecureId`]. The registry is opened once per driver
//! session and hands out [`ShmHandle`]s; a handle is a counted reference to
//! one allocation and releases it when the last clone is dropped.
//!
//! The backend that actually owns the memory sits behind [`UmpBackend`], so
//! the registry works the same over a kernel UMP device or the memfd-backed
//! [`MemfdBackend`](super::MemfdBackend).

use crate::error::{Error, Result};
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

/// Identifier naming a shared memory allocation across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecureId(pub u32);

impl SecureId {
    /// Sentinel returned by devices that could not name an allocation.
    pub const INVALID: SecureId = SecureId(u32::MAX);

    /// Is this a usable id?
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for SecureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Cache maintenance operation over a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    /// Write dirty CPU cache lines back to memory.
    Clean,
    /// Write back, then drop the lines so the next CPU read hits memory.
    CleanAndInvalidate,
}

impl SyncOp {
    /// Short name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Clean => "clean",
            SyncOp::CleanAndInvalidate => "clean_invalidate",
        }
    }
}

/// A shared memory provider.
///
/// Each method operates on an allocation named by its secure id. `acquire`
/// and `allocate` each add one reference that a matching `release` drops.
pub trait UmpBackend {
    /// Allocate `size` bytes and return the new allocation's id.
    fn allocate(&self, size: usize, cached: bool) -> Result<SecureId>;

    /// Take a reference to an existing allocation, returning its size.
    fn acquire(&self, id: SecureId) -> Result<usize>;

    /// Map the allocation into this process.
    fn map(&self, id: SecureId) -> Result<NonNull<u8>>;

    /// Undo one `map`.
    fn unmap(&self, id: SecureId, addr: NonNull<u8>);

    /// Perform cache maintenance over `len` bytes at `addr`.
    fn sync(&self, id: SecureId, op: SyncOp, addr: NonNull<u8>, len: usize) -> Result<()>;

    /// Drop one reference to the allocation.
    fn release(&self, id: SecureId);
}

/// Lets the session share a backend it still needs direct access to
/// (e.g. to import device memory after the registry is open).
impl<B: UmpBackend + ?Sized> UmpBackend for Rc<B> {
    fn allocate(&self, size: usize, cached: bool) -> Result<SecureId> {
        (**self).allocate(size, cached)
    }

    fn acquire(&self, id: SecureId) -> Result<usize> {
        (**self).acquire(id)
    }

    fn map(&self, id: SecureId) -> Result<NonNull<u8>> {
        (**self).map(id)
    }

    fn unmap(&self, id: SecureId, addr: NonNull<u8>) {
        (**self).unmap(id, addr)
    }

    fn sync(&self, id: SecureId, op: SyncOp, addr: NonNull<u8>, len: usize) -> Result<()> {
        (**self).sync(id, op, addr, len)
    }

    fn release(&self, id: SecureId) {
        (**self).release(id)
    }
}

/// Counters of the calls made through a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UmpStats {
    /// Allocations created or wrapped.
    pub opened: u64,
    /// Allocations released.
    pub released: u64,
    /// Map calls.
    pub maps: u64,
    /// Unmap calls.
    pub unmaps: u64,
    /// Clean syncs.
    pub cleans: u64,
    /// Clean-and-invalidate syncs.
    pub clean_invalidates: u64,
}

impl UmpStats {
    /// Allocations currently held through the registry.
    pub fn live(&self) -> u64 {
        self.opened - self.released
    }
}

struct RegistryInner {
    backend: Box<dyn UmpBackend>,
    stats: Cell<UmpStats>,
}

impl RegistryInner {
    fn record(&self, f: impl FnOnce(&mut UmpStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

/// Session-wide entry point to the shared memory provider.
///
/// Cloning is cheap and shares the same backend.
#[derive(Clone)]
pub struct UmpRegistry {
    inner: Rc<RegistryInner>,
}

impl UmpRegistry {
    /// Open the registry over a backend.
    pub fn open(backend: impl UmpBackend + 'static) -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                backend: Box::new(backend),
                stats: Cell::new(UmpStats::default()),
            }),
        }
    }

    /// Allocate a new shared region.
    pub fn allocate(&self, size: usize, cached: bool) -> Result<ShmHandle> {
        if size == 0 {
            return Err(Error::Allocation("size must be greater than 0".into()));
        }
        let id = self.inner.backend.allocate(size, cached)?;
        self.inner.record(|s| s.opened += 1);
        tracing::trace!(secure_id = %id, size, cached, "allocated shared memory");
        Ok(ShmHandle::new(self.clone(), id, size))
    }

    /// Wrap an allocation created elsewhere (e.g. the framebuffer).
    pub fn from_secure_id(&self, id: SecureId) -> Result<ShmHandle> {
        if !id.is_valid() {
            return Err(Error::NotFound("invalid secure id".into()));
        }
        let size = self.inner.backend.acquire(id)?;
        self.inner.record(|s| s.opened += 1);
        tracing::trace!(secure_id = %id, size, "wrapped shared memory");
        Ok(ShmHandle::new(self.clone(), id, size))
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> UmpStats {
        self.inner.stats.get()
    }
}

impl fmt::Debug for UmpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UmpRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

struct HandleInner {
    registry: UmpRegistry,
    id: SecureId,
    size: usize,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.registry.inner.backend.release(self.id);
        self.registry.inner.record(|s| s.released += 1);
        tracing::trace!(secure_id = %self.id, "released shared memory");
    }
}

/// Counted reference to one shared allocation.
///
/// Clones share the reference; the allocation is released exactly once, when
/// the last clone drops.
#[derive(Clone)]
pub struct ShmHandle {
    inner: Rc<HandleInner>,
}

impl ShmHandle {
    fn new(registry: UmpRegistry, id: SecureId, size: usize) -> Self {
        Self {
            inner: Rc::new(HandleInner { registry, id, size }),
        }
    }

    /// The id other processes use to open this allocation.
    #[inline]
    pub fn secure_id(&self) -> SecureId {
        self.inner.id
    }

    /// Size of the allocation in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of live clones of this handle.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Map the allocation into this process.
    pub fn map(&self) -> Result<NonNull<u8>> {
        let registry = &self.inner.registry.inner;
        let addr = registry.backend.map(self.inner.id)?;
        registry.record(|s| s.maps += 1);
        Ok(addr)
    }

    /// Undo a `map`.
    pub fn unmap(&self, addr: NonNull<u8>) {
        let registry = &self.inner.registry.inner;
        registry.backend.unmap(self.inner.id, addr);
        registry.record(|s| s.unmaps += 1);
    }

    /// Cache maintenance over `len` bytes of a mapping of this allocation.
    pub fn sync(&self, op: SyncOp, addr: NonNull<u8>, len: usize) -> Result<()> {
        let registry = &self.inner.registry.inner;
        registry.backend.sync(self.inner.id, op, addr, len)?;
        registry.record(|s| match op {
            SyncOp::Clean => s.cleans += 1,
            SyncOp::CleanAndInvalidate => s.clean_invalidates += 1,
        });
        crate::observability::record_cache_sync(op);
        Ok(())
    }
}

impl fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmHandle")
            .field("secure_id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("refs", &self.ref_count())
            .finish()
    }
}
