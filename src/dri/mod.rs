//! Render buffer management for direct-rendering clients.
//!
//! A client asks for one buffer per attachment point of a drawable, renders
//! into it with the GPU and asks for a region to be presented. Buffers come
//! from one of three places:
//!
//! - **flip**: for windows, when page flipping is enabled and the server
//!   allows it, the front and back buffers are the two pages of the
//!   double-height virtual framebuffer. `flags` carries the byte offset of the
//!   back page so the client renders into the hidden half.
//! - **front**: the drawable's own surface, shared by reference.
//! - **offscreen**: a freshly allocated surface.
//!
//! Presenting swaps pages by moving the scan offset when both buffers are
//! flip buffers and copies the region otherwise.
//!
//! # Example
//!
//! ```rust,ignore
//! let back = manager.create_buffer(&mut screen, &drawable, Attachment::BackLeft, 0)?;
//! let front = manager.create_buffer(&mut screen, &drawable, Attachment::FrontLeft, 0)?;
//! manager.present(&mut screen, &drawable, &damage, &front, &back);
//! manager.destroy_buffer(&mut screen, Some(back));
//! manager.destroy_buffer(&mut screen, Some(front));
//! ```

mod flip;
mod manager;
pub mod version;

pub use flip::PresentOutcome;
pub use manager::BufferManager;

use crate::accel::Accel;
use crate::error::Result;
use crate::fbdev::DisplayGeometry;
use crate::memory::SecureId;
use crate::region::Region;
use crate::surface::{Drawable, SurfaceId};

/// Attachment points of a drawable, with their protocol codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Attachment {
    /// Front left buffer (the visible content).
    FrontLeft = 0,
    /// Back left buffer.
    BackLeft = 1,
    /// Front right buffer.
    FrontRight = 2,
    /// Back right buffer.
    BackRight = 3,
    /// Depth buffer.
    Depth = 4,
    /// Stencil buffer.
    Stencil = 5,
    /// Accumulation buffer.
    Accum = 6,
    /// Client-side copy of the front left buffer.
    FakeFrontLeft = 7,
    /// Client-side copy of the front right buffer.
    FakeFrontRight = 8,
    /// Combined depth and stencil buffer.
    DepthStencil = 9,
}

impl Attachment {
    /// Decode a protocol attachment code.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Attachment::FrontLeft,
            1 => Attachment::BackLeft,
            2 => Attachment::FrontRight,
            3 => Attachment::BackRight,
            4 => Attachment::Depth,
            5 => Attachment::Stencil,
            6 => Attachment::Accum,
            7 => Attachment::FakeFrontLeft,
            8 => Attachment::FakeFrontRight,
            9 => Attachment::DepthStencil,
            _ => return None,
        })
    }

    /// The protocol code.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether this attachment is one of the two pages of a flip.
    #[inline]
    pub fn is_flip_pair(self) -> bool {
        matches!(self, Attachment::FrontLeft | Attachment::BackLeft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SurfaceRef {
    /// A reference taken on the drawable's surface.
    Borrowed(SurfaceId),
    /// A surface created for this buffer.
    Owned(SurfaceId),
}

impl SurfaceRef {
    fn id(self) -> SurfaceId {
        match self {
            SurfaceRef::Borrowed(id) | SurfaceRef::Owned(id) => id,
        }
    }
}

/// A render buffer handed to a client.
///
/// Not `Clone`: destroying consumes the handle, so a buffer is released
/// exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    /// Attachment point.
    pub attachment: Attachment,
    /// Bytes per line.
    pub pitch: u32,
    /// Bytes per pixel.
    pub cpp: u32,
    /// Secure id of the backing memory.
    pub name: SecureId,
    /// Byte offset into the backing memory (non-zero for the back page of a flip).
    pub flags: u32,
    /// Format (depth) the client asked for, 0 for the drawable's depth.
    pub format: u32,
    pub(crate) surface: SurfaceRef,
    pub(crate) page_flipped: bool,
}

impl BufferHandle {
    /// The surface backing this buffer.
    pub fn surface(&self) -> SurfaceId {
        self.surface.id()
    }

    /// Whether the surface was created for this buffer (as opposed to shared
    /// with the drawable).
    pub fn owns_surface(&self) -> bool {
        matches!(self.surface, SurfaceRef::Owned(_))
    }

    /// Whether this buffer is a page of the flip pair.
    pub fn is_page_flipped(&self) -> bool {
        self.page_flipped
    }
}

/// What the buffer manager needs from the display server.
pub trait ServerHooks {
    /// Whether the server allows flipping for this drawable (e.g. a
    /// fullscreen, unredirected window).
    fn can_flip(&self, drawable: &Drawable) -> bool;

    /// Copy `region` from `src` to `dst` at identical coordinates.
    fn copy_region(
        &self,
        accel: &mut Accel,
        src: SurfaceId,
        dst: SurfaceId,
        region: &Region,
    ) -> Result<()> {
        crate::accel::copy_region(accel, src, dst, region)
    }
}

/// Server hooks with a fixed flip policy and the software copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareServer {
    /// Answer for every `can_flip` query.
    pub flippable: bool,
}

impl SoftwareServer {
    /// Hooks that allow flipping for every window.
    pub fn flippable() -> Self {
        Self { flippable: true }
    }
}

impl ServerHooks for SoftwareServer {
    fn can_flip(&self, _drawable: &Drawable) -> bool {
        self.flippable
    }
}

/// Screen state the buffer manager operates on, borrowed from the session.
pub struct ScreenState<'a> {
    /// Last known screen description.
    pub geometry: &'a mut DisplayGeometry,
    /// Surfaces and their storage.
    pub accel: &'a mut Accel,
    /// The display server.
    pub hooks: &'a dyn ServerHooks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_codes() {
        for raw in 0..10 {
            assert_eq!(Attachment::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(Attachment::from_raw(10), None);
        assert_eq!(Attachment::from_raw(7), Some(Attachment::FakeFrontLeft));
    }

    #[test]
    fn test_flip_pair() {
        assert!(Attachment::FrontLeft.is_flip_pair());
        assert!(Attachment::BackLeft.is_flip_pair());
        assert!(!Attachment::FakeFrontLeft.is_flip_pair());
        assert!(!Attachment::Depth.is_flip_pair());
    }

    #[test]
    fn test_software_server() {
        let window = Drawable::window(SurfaceId(1), 8, 8, 24);
        assert!(!SoftwareServer::default().can_flip(&window));
        assert!(SoftwareServer::flippable().can_flip(&window));
    }
}
