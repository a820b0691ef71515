//! Driver-private storage record attached to every surface.

use super::ump::{SecureId, ShmHandle};
use std::ptr::NonNull;

/// The shared allocation backing a surface.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub(crate) handle: ShmHandle,
    pub(crate) byte_size: usize,
}

impl MemoryRecord {
    /// Wrap a handle, recording how many bytes of it the surface uses.
    pub fn new(handle: ShmHandle, byte_size: usize) -> Self {
        Self { handle, byte_size }
    }

    /// The backing handle.
    pub fn handle(&self) -> &ShmHandle {
        &self.handle
    }

    /// Bytes covered by the surface (pitch × height).
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Secure id naming the allocation.
    pub fn secure_id(&self) -> SecureId {
        self.handle.secure_id()
    }
}

/// Per-surface memory state.
///
/// `refs` counts open CPU access windows. A non-framebuffer storage holds a
/// CPU mapping exactly while `refs > 0`; the framebuffer keeps its mapping
/// once created.
#[derive(Debug, Default)]
pub struct SurfaceStorage {
    pub(crate) record: Option<MemoryRecord>,
    pub(crate) mapping: Option<NonNull<u8>>,
    pub(crate) refs: u32,
    pub(crate) gpu_access: bool,
    pub(crate) is_framebuffer: bool,
    pub(crate) bits_per_pixel: u32,
}

impl SurfaceStorage {
    /// Empty storage with no backing memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The backing allocation, if any.
    pub fn record(&self) -> Option<&MemoryRecord> {
        self.record.as_ref()
    }

    /// Open CPU access windows.
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// CPU address, available only inside an access window.
    pub fn mapped_address(&self) -> Option<NonNull<u8>> {
        if self.refs > 0 { self.mapping } else { None }
    }

    /// Whether a CPU mapping currently exists, in or out of an access window.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the GPU may have written this memory since the last CPU access.
    pub fn gpu_access(&self) -> bool {
        self.gpu_access
    }

    /// Mark the memory as shared with the GPU.
    pub fn set_gpu_access(&mut self, gpu_access: bool) {
        self.gpu_access = gpu_access;
    }

    /// Whether this storage is the physical framebuffer.
    pub fn is_framebuffer(&self) -> bool {
        self.is_framebuffer
    }

    /// Bits per pixel recorded when the backing memory was attached.
    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// Drop the backing allocation and any mapping.
    ///
    /// The framebuffer record is kept for the lifetime of the session.
    pub(crate) fn release(&mut self) {
        if self.is_framebuffer {
            return;
        }
        if self.refs > 0 {
            tracing::warn!(refs = self.refs, "releasing surface storage inside an access window");
        }
        if let (Some(record), Some(addr)) = (self.record.as_ref(), self.mapping.take()) {
            record.handle.unmap(addr);
        }
        self.refs = 0;
        self.record = None;
    }
}

impl Drop for SurfaceStorage {
    fn drop(&mut self) {
        // The framebuffer mapping lives as long as its storage.
        if let (Some(record), Some(addr)) = (self.record.as_ref(), self.mapping.take()) {
            record.handle.unmap(addr);
        }
    }
}
