//! CPU access windows over shared surface memory.
//!
//! CPU and GPU share the same physical pages without hardware coherency, so
//! every CPU access is bracketed:
//!
//! - [`SurfaceStorage::prepare_access`] maps the memory on the first open
//!   window and, when the GPU may have written it, cleans and invalidates the
//!   CPU cache so no stale line is read.
//! - [`SurfaceStorage::finish_access`] cleans the cache so the GPU and the
//!   display see the CPU's writes, and unmaps when the last window closes.
//!
//! Calls must pair up. [`AccessGuard`] does the pairing on drop.

use super::storage::SurfaceStorage;
use super::ump::SyncOp;
use crate::error::{Error, Result};
use std::ptr::NonNull;

impl SurfaceStorage {
    /// Open a CPU access window and return the CPU address of the memory.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the surface has no backing memory.
    /// - [`Error::Mapping`] if the memory cannot be mapped or synced.
    pub fn prepare_access(&mut self) -> Result<NonNull<u8>> {
        let Some(record) = self.record.as_ref() else {
            tracing::error!("prepare_access on a surface without memory record");
            return Err(Error::NotFound("surface has no memory record".into()));
        };

        let fresh = self.mapping.is_none();
        let addr = match self.mapping {
            Some(addr) => addr,
            None => {
                debug_assert_eq!(self.refs, 0);
                record
                    .handle
                    .map()
                    .map_err(|e| Error::Mapping(format!("cpu address not set: {e}")))?
            }
        };

        if self.gpu_access {
            if let Err(e) = record
                .handle
                .sync(SyncOp::CleanAndInvalidate, addr, record.byte_size)
            {
                if fresh {
                    record.handle.unmap(addr);
                }
                return Err(Error::Mapping(format!("cache invalidate failed: {e}")));
            }
        }

        self.mapping = Some(addr);
        self.refs += 1;
        tracing::trace!(
            secure_id = %record.secure_id(),
            refs = self.refs,
            synced = self.gpu_access,
            "prepare access"
        );
        Ok(addr)
    }

    /// Close a CPU access window.
    pub fn finish_access(&mut self) {
        let Some(record) = self.record.as_ref() else {
            return;
        };

        if self.refs == 0 {
            tracing::error!(
                secure_id = %record.secure_id(),
                "finish_access without a matching prepare_access"
            );
            return;
        }

        let Some(addr) = self.mapping else {
            tracing::error!(secure_id = %record.secure_id(), "open access window lost its mapping");
            self.refs -= 1;
            return;
        };

        if self.gpu_access {
            if let Err(e) = record.handle.sync(SyncOp::Clean, addr, record.byte_size) {
                tracing::warn!(secure_id = %record.secure_id(), error = %e, "cache clean failed");
            }
        }

        if self.refs == 1 && !self.is_framebuffer {
            record.handle.unmap(addr);
            self.mapping = None;
        }

        self.refs -= 1;
        tracing::trace!(secure_id = %record.secure_id(), refs = self.refs, "finish access");
    }

    /// Open an access window that closes when the guard drops.
    pub fn access(&mut self) -> Result<AccessGuard<'_>> {
        let addr = self.prepare_access()?;
        Ok(AccessGuard {
            storage: self,
            addr,
        })
    }

    /// Flush CPU writes made outside an access window before the GPU takes
    /// over the memory.
    pub(crate) fn clean_for_gpu(&self) {
        if let (Some(record), Some(addr)) = (self.record.as_ref(), self.mapping) {
            if let Err(e) = record.handle.sync(SyncOp::Clean, addr, record.byte_size) {
                tracing::warn!(secure_id = %record.secure_id(), error = %e, "cache clean failed");
            }
        }
    }
}

/// RAII CPU access window over a [`SurfaceStorage`].
pub struct AccessGuard<'a> {
    storage: &'a mut SurfaceStorage,
    addr: NonNull<u8>,
}

impl AccessGuard<'_> {
    /// CPU address of the memory.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Bytes accessible through this window.
    pub fn len(&self) -> usize {
        self.storage.record.as_ref().map_or(0, |r| r.byte_size)
    }

    /// Returns true if the window covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The memory as bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers byte_size bytes and stays alive while the window is open.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len()) }
    }

    /// The memory as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self makes this the only CPU view in the process.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len()) }
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.storage.finish_access();
    }
}
