//! Surfaces (pixmaps) and the drawables that reference them.

use crate::memory::SurfaceStorage;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

/// Identifier of a surface in a [`SurfaceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Bits per pixel the server uses for a given depth.
pub fn bits_per_pixel_for_depth(depth: u32) -> Option<u32> {
    match depth {
        1 => Some(1),
        4 | 8 => Some(8),
        15 | 16 => Some(16),
        24 | 30 | 32 => Some(32),
        _ => None,
    }
}

/// Bytes per line without alignment: `ceil(width * bpp / 8)`.
///
/// Returns `None` if the line does not fit in a `u32`.
pub fn min_pitch(width: u32, bits_per_pixel: u32) -> Option<u32> {
    let bits = u64::from(width) * u64::from(bits_per_pixel);
    u32::try_from(bits.div_ceil(8)).ok()
}

/// A pixel buffer with its driver-private storage.
#[derive(Debug)]
pub struct Surface {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) bits_per_pixel: u32,
    pub(crate) pitch: u32,
    /// CPU pointer the server may use; set only inside an access window or
    /// for server-provided pixel data.
    pub(crate) data: Option<NonNull<u8>>,
    pub(crate) refcnt: u32,
    pub(crate) storage: SurfaceStorage,
}

impl Surface {
    pub(crate) fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            depth: 0,
            bits_per_pixel: 0,
            pitch: 0,
            data: None,
            refcnt: 1,
            storage: SurfaceStorage::new(),
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Color depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Bits per pixel.
    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// Bytes per line.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// CPU pointer currently exposed to the server.
    pub fn data(&self) -> Option<NonNull<u8>> {
        self.data
    }

    /// Number of references held on the surface.
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Driver-private storage.
    pub fn storage(&self) -> &SurfaceStorage {
        &self.storage
    }

    /// Driver-private storage, mutably.
    pub fn storage_mut(&mut self) -> &mut SurfaceStorage {
        &mut self.storage
    }
}

/// Owner of all surfaces of a screen.
#[derive(Debug, Default)]
pub struct SurfaceTable {
    surfaces: HashMap<SurfaceId, Surface>,
    next_id: u32,
    screen: Option<SurfaceId>,
}

impl SurfaceTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, surface: Surface) -> SurfaceId {
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        self.surfaces.insert(id, surface);
        id
    }

    pub(crate) fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        if self.screen == Some(id) {
            self.screen = None;
        }
        self.surfaces.remove(&id)
    }

    /// Look up a surface.
    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Look up a surface mutably.
    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    /// Number of live surfaces.
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// Returns true if no surface is alive.
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// The surface scanned out by the display, if registered.
    pub fn screen(&self) -> Option<SurfaceId> {
        self.screen
    }

    pub(crate) fn set_screen(&mut self, id: SurfaceId) {
        self.screen = Some(id);
    }
}

/// What kind of drawable a client renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawableKind {
    /// An on-screen window.
    Window,
    /// An offscreen pixmap.
    Pixmap,
}

/// Geometry of a client drawable and the surface backing it.
///
/// For a window, `surface` is the window's backing surface; for a pixmap it
/// is the pixmap itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drawable {
    /// Window or pixmap.
    pub kind: DrawableKind,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Color depth.
    pub depth: u32,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
    /// Backing surface.
    pub surface: SurfaceId,
}

impl Drawable {
    /// A window drawable backed by `surface`.
    pub fn window(surface: SurfaceId, width: u32, height: u32, depth: u32) -> Self {
        Self {
            kind: DrawableKind::Window,
            width,
            height,
            depth,
            bits_per_pixel: bits_per_pixel_for_depth(depth).unwrap_or(32),
            surface,
        }
    }

    /// A pixmap drawable.
    pub fn pixmap(surface: SurfaceId, width: u32, height: u32, depth: u32) -> Self {
        Self {
            kind: DrawableKind::Pixmap,
            ..Self::window(surface, width, height, depth)
        }
    }

    /// Returns true for windows.
    pub fn is_window(&self) -> bool {
        self.kind == DrawableKind::Window
    }
}
