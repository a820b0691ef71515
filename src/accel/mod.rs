//! Surface storage hooks for the server's acceleration layer.
//!
//! The server creates and resizes surfaces through these hooks and brackets
//! every software rendering pass with [`Accel::prepare_access`] /
//! [`Accel::finish_access`]. Solid fills, blits and composites are left to
//! the server's software fallbacks.
//!
//! Storage comes from three places:
//!
//! - the physical framebuffer (the screen surface), named by the secure id the
//!   display device reports,
//! - a fresh shared allocation sized `align(ceil(width * bpp / 8)) * height`,
//! - pixel data the server owns, which this layer only tracks.

mod blit;

pub use blit::copy_region;

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::fbdev::FramebufferDevice;
use crate::memory::{MemoryRecord, SurfaceStorage, UmpRegistry};
use crate::surface::{Surface, SurfaceId, SurfaceTable, bits_per_pixel_for_depth, min_pitch};
use std::ptr::NonNull;
use std::rc::Rc;

/// Where a surface's pixels live, as passed to
/// [`Accel::modify_surface_storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelData {
    /// Driver-allocated shared memory.
    None,
    /// The physical framebuffer.
    Framebuffer,
    /// Memory owned by the server.
    External(NonNull<u8>),
}

/// Round `value` up to a multiple of the power of two `base`.
#[inline]
fn align(value: u32, base: u32) -> Option<u32> {
    Some(value.checked_add(base - 1)? & !(base - 1))
}

/// Header fields of a surface, staged until its memory is settled.
#[derive(Debug, Clone, Copy)]
struct Header {
    width: u32,
    height: u32,
    depth: u32,
    bits_per_pixel: u32,
    pitch: u32,
}

impl Header {
    fn of(surface: &Surface) -> Self {
        Self {
            width: surface.width,
            height: surface.height,
            depth: surface.depth,
            bits_per_pixel: surface.bits_per_pixel,
            pitch: surface.pitch,
        }
    }

    fn apply(self, surface: &mut Surface) {
        surface.width = self.width;
        surface.height = self.height;
        surface.depth = self.depth;
        surface.bits_per_pixel = self.bits_per_pixel;
        surface.pitch = self.pitch;
    }
}

/// The acceleration layer of one screen.
pub struct Accel {
    ump: UmpRegistry,
    device: Rc<dyn FramebufferDevice>,
    surfaces: SurfaceTable,
    pitch_align: u32,
    ump_cached: bool,
}

impl Accel {
    /// Create the layer over an open shared memory registry.
    pub fn new(ump: UmpRegistry, device: Rc<dyn FramebufferDevice>, config: &DriverConfig) -> Self {
        Self {
            ump,
            device,
            surfaces: SurfaceTable::new(),
            pitch_align: config.pitch_align.max(1).next_power_of_two(),
            ump_cached: config.ump_cached,
        }
    }

    /// The shared memory registry.
    pub fn ump(&self) -> &UmpRegistry {
        &self.ump
    }

    /// All surfaces of the screen.
    pub fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    /// Look up a surface.
    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(id)
    }

    /// Look up a surface mutably.
    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(id)
    }

    pub(crate) fn get(&self, id: SurfaceId) -> Result<&Surface> {
        self.surfaces
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("no {id}")))
    }

    pub(crate) fn get_mut(&mut self, id: SurfaceId) -> Result<&mut Surface> {
        self.surfaces
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("no {id}")))
    }

    /// Create a surface with empty storage and one reference.
    pub fn create_surface_storage(&mut self) -> SurfaceId {
        self.surfaces.insert(Surface::new())
    }

    /// Drop a surface's backing memory. The framebuffer keeps its memory.
    pub fn destroy_surface_storage(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.storage.release();
        }
    }

    /// Update a surface's header and attach backing memory.
    ///
    /// Zero arguments leave the corresponding header field unchanged. On
    /// error the surface keeps its previous header.
    pub fn modify_surface_storage(
        &mut self,
        id: SurfaceId,
        width: u32,
        height: u32,
        depth: u32,
        bits_per_pixel: u32,
        pitch: u32,
        data: PixelData,
    ) -> Result<()> {
        let pitch_align = self.pitch_align;
        let cached = self.ump_cached;
        let device = Rc::clone(&self.device);
        let ump = self.ump.clone();
        let surface = self.get_mut(id)?;

        let mut header = Header::of(surface);
        if width > 0 {
            header.width = width;
        }
        if height > 0 {
            header.height = height;
        }
        if depth > 0 {
            header.depth = depth;
        }
        if bits_per_pixel > 0 {
            header.bits_per_pixel = bits_per_pixel;
        }
        if pitch > 0 {
            header.pitch = pitch;
        }

        match data {
            PixelData::Framebuffer => {
                attach_framebuffer(&mut surface.storage, &header, &*device, &ump)?;
            }
            PixelData::External(ptr) => {
                if surface.storage.record.is_none() {
                    return Err(Error::NotFound(
                        "external pixel data without a memory record".into(),
                    ));
                }
                surface.storage.is_framebuffer = false;
                surface.data = Some(ptr);
            }
            PixelData::None => {
                header.pitch = min_pitch(header.width, header.bits_per_pixel)
                    .and_then(|pitch| align(pitch, pitch_align))
                    .ok_or_else(|| too_large(&header))?;
                allocate_backing(&mut surface.storage, &header, &ump, cached)?;
                surface.data = None;
            }
        }

        header.apply(surface);
        Ok(())
    }

    /// Whether the server must treat the surface as offscreen (not directly
    /// addressable by the CPU right now).
    pub fn is_offscreen(&self, id: SurfaceId) -> bool {
        if self.surfaces.screen() == Some(id) {
            return true;
        }
        self.surfaces
            .get(id)
            .is_some_and(|surface| surface.data.is_none())
    }

    /// Open a CPU access window on a surface and expose its address.
    pub fn prepare_access(&mut self, id: SurfaceId) -> Result<NonNull<u8>> {
        let surface = self.get_mut(id)?;
        let addr = surface.storage.prepare_access()?;
        surface.data = Some(addr);
        Ok(addr)
    }

    /// Close a CPU access window on a surface.
    pub fn finish_access(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.get_mut(id) else {
            return;
        };
        surface.storage.finish_access();
        if surface.storage.record.is_some() && surface.storage.refs == 0 {
            surface.data = None;
        }
    }

    /// Open a CPU access window that closes when the guard drops.
    pub fn access(&mut self, id: SurfaceId) -> Result<SurfaceAccess<'_>> {
        let addr = self.prepare_access(id)?;
        Ok(SurfaceAccess {
            accel: self,
            id,
            addr,
        })
    }

    /// Create a `width × height` surface with shared backing memory.
    pub fn create_surface(&mut self, width: u32, height: u32, depth: u32) -> Result<SurfaceId> {
        let bits_per_pixel = bits_per_pixel_for_depth(depth)
            .ok_or_else(|| Error::Allocation(format!("unsupported depth {depth}")))?;

        let id = self.create_surface_storage();
        if let Err(e) =
            self.modify_surface_storage(id, width, height, depth, bits_per_pixel, 0, PixelData::None)
        {
            self.surfaces.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Create the screen surface backed by the physical framebuffer.
    pub fn create_screen_surface(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        bits_per_pixel: u32,
        pitch: u32,
    ) -> Result<SurfaceId> {
        let id = self.create_surface_storage();
        if let Err(e) = self.modify_surface_storage(
            id,
            width,
            height,
            depth,
            bits_per_pixel,
            pitch,
            PixelData::Framebuffer,
        ) {
            self.surfaces.remove(id);
            return Err(e);
        }
        self.surfaces.set_screen(id);
        Ok(id)
    }

    /// Take another reference on a surface.
    pub fn reference_surface(&mut self, id: SurfaceId) -> Result<()> {
        self.get_mut(id)?.refcnt += 1;
        Ok(())
    }

    /// Drop a reference on a surface, destroying it at zero.
    pub fn destroy_surface(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.get_mut(id) else {
            tracing::warn!(surface = %id, "destroy of unknown surface");
            return;
        };
        surface.refcnt = surface.refcnt.saturating_sub(1);
        if surface.refcnt == 0 {
            self.destroy_surface_storage(id);
            self.surfaces.remove(id);
        }
    }

    /// Make sure the surface has backing memory before it is shared.
    pub fn ensure_backing(&self, id: SurfaceId) -> Result<&SurfaceStorage> {
        let storage = &self.get(id)?.storage;
        if storage.record.is_none() {
            return Err(Error::Allocation(format!("{id} has no backing memory")));
        }
        Ok(storage)
    }
}

impl std::fmt::Debug for Accel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accel")
            .field("surfaces", &self.surfaces.len())
            .field("ump", &self.ump)
            .field("pitch_align", &self.pitch_align)
            .field("ump_cached", &self.ump_cached)
            .finish()
    }
}

fn too_large(header: &Header) -> Error {
    Error::Allocation(format!(
        "{}x{} at {} bpp does not fit in memory",
        header.width, header.height, header.bits_per_pixel
    ))
}

fn byte_size(header: &Header) -> Result<usize> {
    (header.pitch as usize)
        .checked_mul(header.height as usize)
        .ok_or_else(|| too_large(header))
}

fn attach_framebuffer(
    storage: &mut SurfaceStorage,
    header: &Header,
    device: &dyn FramebufferDevice,
    ump: &UmpRegistry,
) -> Result<()> {
    if storage.record.is_some() {
        storage.is_framebuffer = true;
        return Ok(());
    }

    let byte_size = byte_size(header)?;
    let secure_id = device.ump_secure_id().inspect_err(|e| {
        tracing::error!(error = %e, "failed to retrieve framebuffer secure id");
    })?;

    let handle = ump.from_secure_id(secure_id).map_err(|e| {
        tracing::error!(secure_id = %secure_id, error = %e, "failed to open framebuffer memory");
        Error::Allocation(format!("framebuffer handle from {secure_id}: {e}"))
    })?;

    if byte_size > handle.size() {
        return Err(Error::Allocation(format!(
            "framebuffer memory holds {} bytes, screen needs {byte_size}",
            handle.size()
        )));
    }

    storage.record = Some(MemoryRecord::new(handle, byte_size));
    storage.is_framebuffer = true;
    if header.bits_per_pixel != 0 {
        storage.bits_per_pixel = header.bits_per_pixel;
    }
    tracing::debug!(secure_id = %secure_id, byte_size, "attached framebuffer memory");
    Ok(())
}

/// Give `storage` a record of `header.pitch * header.height` bytes.
///
/// The old record is only replaced once the new allocation succeeded.
fn allocate_backing(
    storage: &mut SurfaceStorage,
    header: &Header,
    ump: &UmpRegistry,
    cached: bool,
) -> Result<()> {
    let size = byte_size(header)?;

    if let Some(record) = &storage.record {
        if record.byte_size == size && !storage.is_framebuffer {
            return Ok(());
        }
        if storage.refs > 0 {
            return Err(Error::Allocation(
                "cannot resize a surface inside an access window".into(),
            ));
        }
    }

    // Zero-sized surfaces succeed without backing memory.
    if size == 0 {
        storage.is_framebuffer = false;
        storage.release();
        return Ok(());
    }

    let handle = ump.allocate(size, cached).map_err(|e| {
        tracing::error!(size, error = %e, "failed to allocate surface memory");
        Error::Allocation(format!("{size} bytes of shared memory: {e}"))
    })?;

    storage.is_framebuffer = false;
    storage.release();
    storage.record = Some(MemoryRecord::new(handle, size));
    storage.gpu_access = false;
    storage.bits_per_pixel = header.bits_per_pixel;
    Ok(())
}

/// RAII CPU access window over a surface.
pub struct SurfaceAccess<'a> {
    accel: &'a mut Accel,
    id: SurfaceId,
    addr: NonNull<u8>,
}

impl SurfaceAccess<'_> {
    /// The surface being accessed.
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// CPU address of the surface memory.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Bytes per line.
    pub fn pitch(&self) -> u32 {
        self.accel.surfaces.get(self.id).map_or(0, |s| s.pitch)
    }

    /// Bytes accessible through this window.
    pub fn len(&self) -> usize {
        self.accel
            .surfaces
            .get(self.id)
            .and_then(|s| s.storage.record.as_ref())
            .map_or(0, |r| r.byte_size)
    }

    /// Returns true if the window covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The surface memory as bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers len() bytes while the window is open.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len()) }
    }

    /// The surface memory as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len();
        // SAFETY: as above; &mut self makes this the only CPU view in the process.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), len) }
    }
}

impl Drop for SurfaceAccess<'_> {
    fn drop(&mut self) {
        self.accel.finish_access(self.id);
    }
}
