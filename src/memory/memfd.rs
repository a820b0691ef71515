//! Shared memory provider backed by Linux memfd.
//!
//! Every allocation is an anonymous `memfd_create` file; mapping it with
//! `MAP_SHARED` gives every mapping the same physical pages, which is the
//! property the GPU and display controller rely on. Cache maintenance is
//! `msync`, with `MS_INVALIDATE` for the invalidate half.
//!
//! Externally owned memory (the framebuffer of a
//! [`VirtualFramebuffer`](crate::fbdev::VirtualFramebuffer)) can be
//! registered with [`MemfdBackend::import`] so it is nameable by secure id.

use super::ump::{SecureId, SyncOp, UmpBackend};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;

/// First id handed out; low ids are left for device-provided regions.
const FIRST_SECURE_ID: u32 = 0x100;

struct Allocation {
    fd: OwnedFd,
    len: usize,
    refs: u32,
    cached: bool,
}

/// memfd-backed [`UmpBackend`].
pub struct MemfdBackend {
    allocations: RefCell<HashMap<SecureId, Allocation>>,
    next_id: Cell<u32>,
}

impl MemfdBackend {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            allocations: RefCell::new(HashMap::new()),
            next_id: Cell::new(FIRST_SECURE_ID),
        }
    }

    /// Register an existing memfd (or any mappable fd) under a new secure id.
    ///
    /// The provider holds one reference until every handle taken on the id
    /// has been released.
    pub fn import(&self, fd: OwnedFd, len: usize) -> Result<SecureId> {
        if len == 0 {
            return Err(Error::Allocation("cannot import an empty region".into()));
        }
        Ok(self.insert(fd, len, true))
    }

    /// Number of allocations currently alive.
    pub fn allocation_count(&self) -> usize {
        self.allocations.borrow().len()
    }

    fn insert(&self, fd: OwnedFd, len: usize, cached: bool) -> SecureId {
        let id = SecureId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.allocations.borrow_mut().insert(
            id,
            Allocation {
                fd,
                len,
                refs: 1,
                cached,
            },
        );
        id
    }

    fn with_allocation<T>(&self, id: SecureId, f: impl FnOnce(&Allocation) -> Result<T>) -> Result<T> {
        let allocations = self.allocations.borrow();
        let allocation = allocations
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("no shared memory with secure id {id}")))?;
        f(allocation)
    }
}

impl Default for MemfdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UmpBackend for MemfdBackend {
    fn allocate(&self, size: usize, cached: bool) -> Result<SecureId> {
        let fd = rustix::fs::memfd_create("mali-ump", rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::Allocation(format!("memfd_create failed: {e}")))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::Allocation(format!("ftruncate to {size} bytes failed: {e}")))?;

        let id = self.insert(fd, size, cached);
        // Allocation starts with the caller's reference only.
        Ok(id)
    }

    fn acquire(&self, id: SecureId) -> Result<usize> {
        let mut allocations = self.allocations.borrow_mut();
        let allocation = allocations
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("no shared memory with secure id {id}")))?;
        allocation.refs += 1;
        Ok(allocation.len)
    }

    fn map(&self, id: SecureId) -> Result<NonNull<u8>> {
        self.with_allocation(id, |allocation| {
            // SAFETY: a fresh shared mapping of the whole file; no existing memory is replaced.
            let ptr = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    allocation.len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    &allocation.fd,
                    0,
                )
                .map_err(|e| Error::Mapping(format!("mmap of {id} failed: {e}")))?
            };

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| Error::Mapping("mmap returned null".into()))
        })
    }

    fn unmap(&self, id: SecureId, addr: NonNull<u8>) {
        let result = self.with_allocation(id, |allocation| {
            // SAFETY: addr came from map() of this allocation, which mapped len bytes.
            unsafe { rustix::mm::munmap(addr.as_ptr().cast(), allocation.len)? };
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(secure_id = %id, error = %e, "unmap failed");
        }
    }

    fn sync(&self, id: SecureId, op: SyncOp, addr: NonNull<u8>, len: usize) -> Result<()> {
        self.with_allocation(id, |allocation| {
            if !allocation.cached {
                return Ok(());
            }
            let flags = match op {
                SyncOp::Clean => MsyncFlags::SYNC,
                SyncOp::CleanAndInvalidate => MsyncFlags::SYNC | MsyncFlags::INVALIDATE,
            };
            let len = len.min(allocation.len);
            // SAFETY: the caller passes a live mapping of this allocation.
            unsafe {
                rustix::mm::msync(addr.as_ptr().cast(), len, flags)
                    .map_err(|e| Error::Mapping(format!("{} of {id} failed: {e}", op.as_str())))?;
            }
            Ok(())
        })
    }

    fn release(&self, id: SecureId) {
        let mut allocations = self.allocations.borrow_mut();
        let Some(allocation) = allocations.get_mut(&id) else {
            tracing::warn!(secure_id = %id, "release of unknown shared memory");
            return;
        };
        allocation.refs -= 1;
        if allocation.refs == 0 {
            // fd closes on drop; outstanding mappings keep the pages alive.
            allocations.remove(&id);
        }
    }
}

impl std::fmt::Debug for MemfdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemfdBackend")
            .field("allocations", &self.allocation_count())
            .field("next_id", &self.next_id.get())
            .finish()
    }
}
