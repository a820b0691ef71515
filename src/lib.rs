//! # mali-accel
//!
//! Back-buffer, shared-memory and page-flip management for display drivers
//! on framebuffer devices whose memory is shared with a Mali GPU.
//!
//! The crate sits between a display server and a rendering client:
//!
//! - it hands out render buffers named by the secure id of their shared
//!   memory, so the GPU can render into them,
//! - it brackets every CPU access to shared memory with the cache maintenance
//!   the non-coherent CPU/GPU pair needs,
//! - it presents rendered frames by flipping between the two pages of a
//!   double-height virtual framebuffer, or by copying when flipping is not
//!   possible.
//!
//! ## Features
//!
//! - **Shared memory**: secure-id keyed registry with counted handles
//! - **Access windows**: map, invalidate, clean and unmap around CPU access
//! - **Page flipping**: scan offset cycling with optional vblank gating
//! - **Region copy**: software fallback through access windows
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mali_accel::prelude::*;
//!
//! let mut driver = Driver::virtual_screen(1366, 768, 1536, 32, DriverConfig::flipping())?;
//! driver.create_screen_surface()?;
//! let window = driver.screen_window()?;
//!
//! let front = driver.create_buffer(&window, Attachment::FrontLeft, 0)?;
//! let back = driver.create_buffer(&window, Attachment::BackLeft, 0)?;
//! assert_eq!(back.flags, 1366 * 4 * 768);
//!
//! let damage = Region::from_rect(BoxRect::from_size(1366, 768));
//! driver.present(&window, &damage, &front, &back);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod accel;
pub mod config;
pub mod dri;
pub mod driver;
pub mod error;
pub mod fbdev;
pub mod memory;
pub mod observability;
pub mod region;
pub mod surface;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::accel::{Accel, PixelData, SurfaceAccess};
    pub use crate::config::DriverConfig;
    pub use crate::dri::{
        Attachment, BufferHandle, BufferManager, PresentOutcome, ScreenState, ServerHooks,
        SoftwareServer,
    };
    pub use crate::driver::Driver;
    pub use crate::error::{Error, Result};
    pub use crate::fbdev::{DisplayGeometry, FramebufferDevice, VirtualFramebuffer};
    pub use crate::memory::{MemfdBackend, SecureId, UmpRegistry};
    pub use crate::region::{BoxRect, Region};
    pub use crate::surface::{Drawable, SurfaceId};
}

pub use error::{Error, Result};
