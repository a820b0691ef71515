//! Driver session: one screen driven through one framebuffer device.
//!
//! The session owns everything that lives as long as the screen: the device,
//! the shared memory registry, the surface table, the screen description
//! and the buffer manager. Dropping the session releases them in order.
//!
//! # Example
//!
//! ```rust,ignore
//! use mali_accel::prelude::*;
//!
//! let mut driver = Driver::virtual_screen(1366, 768, 1536, 32, DriverConfig::flipping())?;
//! let screen = driver.create_screen_surface()?;
//! let window = driver.screen_window()?;
//!
//! let front = driver.create_buffer(&window, Attachment::FrontLeft, 0)?;
//! let back = driver.create_buffer(&window, Attachment::BackLeft, 0)?;
//! driver.present(&window, &damage, &front, &back);
//! ```

use crate::accel::Accel;
use crate::config::DriverConfig;
use crate::dri::{
    Attachment, BufferHandle, BufferManager, PresentOutcome, ScreenState, ServerHooks,
    SoftwareServer,
};
use crate::error::{Error, Result};
use crate::fbdev::{DisplayGeometry, FixScreenInfo, FramebufferDevice, VirtualFramebuffer};
use crate::memory::{MemfdBackend, UmpBackend, UmpRegistry};
use crate::observability::{TracingConfig, init_metrics, instrument_session};
use crate::region::Region;
use crate::surface::{Drawable, SurfaceId};
use std::rc::Rc;
use tracing::Span;

/// A driver session for one screen.
pub struct Driver {
    config: DriverConfig,
    device: Rc<dyn FramebufferDevice>,
    geometry: DisplayGeometry,
    fix: FixScreenInfo,
    accel: Accel,
    buffers: Option<BufferManager>,
    hooks: Box<dyn ServerHooks>,
    session: Span,
}

impl Driver {
    /// Start a session over an open device and shared memory provider.
    ///
    /// # Errors
    ///
    /// [`Error::Device`] if the screen description cannot be read.
    pub fn open(
        device: Rc<dyn FramebufferDevice>,
        backend: impl UmpBackend + 'static,
        hooks: impl ServerHooks + 'static,
        config: DriverConfig,
    ) -> Result<Self> {
        Self::open_with_tracing(device, backend, hooks, config, TracingConfig::default())
    }

    /// Start a session with an explicit tracing configuration.
    pub fn open_with_tracing(
        device: Rc<dyn FramebufferDevice>,
        backend: impl UmpBackend + 'static,
        hooks: impl ServerHooks + 'static,
        config: DriverConfig,
        tracing_config: TracingConfig,
    ) -> Result<Self> {
        init_metrics();
        let fix = device.fix_screen_info().inspect_err(|e| {
            tracing::error!(error = %e, "failed to read fixed screen info");
        })?;
        let session = if tracing_config.session_spans {
            instrument_session(fix.id_str())
        } else {
            Span::none()
        };
        let _entered = session.clone().entered();

        let geometry = DisplayGeometry::query(&*device).inspect_err(|e| {
            tracing::error!(error = %e, "failed to read variable screen info");
        })?;

        let var = geometry.var();
        tracing::info!(
            id = fix.id_str(),
            xres = var.xres,
            yres = var.yres,
            xres_virtual = var.xres_virtual,
            yres_virtual = var.yres_virtual,
            bits_per_pixel = var.bits_per_pixel,
            line_length = fix.line_length,
            smem_len = fix.smem_len,
            "opened framebuffer"
        );

        let accel = Accel::new(UmpRegistry::open(backend), Rc::clone(&device), &config);

        let buffers = config.dri2.then(|| {
            BufferManager::new(Rc::clone(&device), &config, fix.id_str())
                .with_tracing(tracing_config.clone())
        });

        if config.page_flipping && !geometry.supports_flipping() {
            tracing::warn!(
                yres = geometry.visible_height(),
                yres_virtual = geometry.virtual_height(),
                "page flipping enabled but the virtual screen holds a single page"
            );
        }
        tracing::info!(
            dri2 = config.dri2,
            page_flipping = config.page_flipping,
            flip_vsync = config.flip_vsync,
            ump_cached = config.ump_cached,
            "driver session ready"
        );

        Ok(Self {
            config,
            device,
            geometry,
            fix,
            accel,
            buffers,
            hooks: Box::new(hooks),
            session,
        })
    }

    /// Start a session over a memory-backed virtual framebuffer.
    ///
    /// The server hooks allow flipping for every window and copy in software.
    pub fn virtual_screen(
        xres: u32,
        yres: u32,
        yres_virtual: u32,
        bits_per_pixel: u32,
        config: DriverConfig,
    ) -> Result<Self> {
        let backend = Rc::new(MemfdBackend::new());
        let device = VirtualFramebuffer::new(&backend, xres, yres, yres_virtual, bits_per_pixel)?;
        Self::open(Rc::new(device), backend, SoftwareServer::flippable(), config)
    }

    /// The session configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The display device.
    pub fn device(&self) -> &dyn FramebufferDevice {
        &*self.device
    }

    /// Last known screen description.
    pub fn geometry(&self) -> &DisplayGeometry {
        &self.geometry
    }

    /// Fixed memory layout of the device.
    pub fn fix_screen_info(&self) -> &FixScreenInfo {
        &self.fix
    }

    /// The span every session call runs in.
    pub fn session_span(&self) -> &Span {
        &self.session
    }

    /// The acceleration layer.
    pub fn accel(&self) -> &Accel {
        &self.accel
    }

    /// The acceleration layer, mutably.
    pub fn accel_mut(&mut self) -> &mut Accel {
        &mut self.accel
    }

    /// Depth of the screen, from the color channel widths when the device
    /// reports them.
    pub fn depth(&self) -> u32 {
        let var = self.geometry.var();
        let channels = var.red.length + var.green.length + var.blue.length;
        if channels != 0 {
            return channels;
        }
        match var.bits_per_pixel {
            32 => 24,
            bpp => bpp,
        }
    }

    /// Create the surface scanned out by the display.
    pub fn create_screen_surface(&mut self) -> Result<SurfaceId> {
        let _session = self.session.enter();
        let var = *self.geometry.var();
        let depth = self.depth();
        self.accel.create_screen_surface(
            var.xres,
            var.yres,
            depth,
            var.bits_per_pixel,
            self.fix.line_length,
        )
    }

    /// The screen surface, once created.
    pub fn screen_surface(&self) -> Option<SurfaceId> {
        self.accel.surfaces().screen()
    }

    /// A window drawable covering the whole screen.
    pub fn screen_window(&self) -> Result<Drawable> {
        let surface = self
            .screen_surface()
            .ok_or_else(|| Error::NotFound("screen surface not created".into()))?;
        let var = self.geometry.var();
        Ok(Drawable::window(surface, var.xres, var.yres, self.depth()))
    }

    /// See [`BufferManager::create_buffer`].
    pub fn create_buffer(
        &mut self,
        drawable: &Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<BufferHandle> {
        let _session = self.session.enter();
        let manager = self.buffers.as_ref().ok_or_else(dri2_disabled)?;
        let mut screen = ScreenState {
            geometry: &mut self.geometry,
            accel: &mut self.accel,
            hooks: &*self.hooks,
        };
        manager.create_buffer(&mut screen, drawable, attachment, format)
    }

    /// See [`BufferManager::destroy_buffer`].
    pub fn destroy_buffer(&mut self, drawable: &Drawable, buffer: Option<BufferHandle>) {
        let _session = self.session.enter();
        let Some(manager) = self.buffers.as_ref() else {
            return;
        };
        let mut screen = ScreenState {
            geometry: &mut self.geometry,
            accel: &mut self.accel,
            hooks: &*self.hooks,
        };
        manager.destroy_buffer(&mut screen, drawable, buffer);
    }

    /// See [`BufferManager::create_buffers`].
    pub fn create_buffers(
        &mut self,
        drawable: &Drawable,
        attachments: &[Attachment],
    ) -> Result<Vec<BufferHandle>> {
        let _session = self.session.enter();
        let manager = self.buffers.as_ref().ok_or_else(dri2_disabled)?;
        let mut screen = ScreenState {
            geometry: &mut self.geometry,
            accel: &mut self.accel,
            hooks: &*self.hooks,
        };
        manager.create_buffers(&mut screen, drawable, attachments)
    }

    /// See [`BufferManager::destroy_buffers`].
    pub fn destroy_buffers(&mut self, drawable: &Drawable, buffers: Vec<BufferHandle>) {
        let _session = self.session.enter();
        let Some(manager) = self.buffers.as_ref() else {
            return;
        };
        let mut screen = ScreenState {
            geometry: &mut self.geometry,
            accel: &mut self.accel,
            hooks: &*self.hooks,
        };
        manager.destroy_buffers(&mut screen, drawable, buffers);
    }

    /// See [`BufferManager::present`].
    pub fn present(
        &mut self,
        drawable: &Drawable,
        region: &Region,
        dst: &BufferHandle,
        src: &BufferHandle,
    ) -> PresentOutcome {
        let _session = self.session.enter();
        let Some(manager) = self.buffers.as_ref() else {
            return PresentOutcome::Skipped;
        };
        let mut screen = ScreenState {
            geometry: &mut self.geometry,
            accel: &mut self.accel,
            hooks: &*self.hooks,
        };
        manager.present(&mut screen, drawable, region, dst, src)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("geometry", &self.geometry)
            .field("accel", &self.accel)
            .field("buffers", &self.buffers)
            .finish()
    }
}

fn dri2_disabled() -> Error {
    Error::Unsupported("DRI2 is disabled".into())
}
