use super::{Attachment, BufferHandle, ScreenState, ServerHooks, SurfaceRef};
use crate::accel::Accel;
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::fbdev::{FB_ACTIVATE_NOW, FramebufferDevice};
use crate::observability::{
    BufferPath, ScreenMetrics, TracingConfig, record_buffer_created, record_buffer_destroyed,
    record_device_failure, span_buffer,
};
use crate::surface::{Drawable, SurfaceId, min_pitch};
use std::rc::Rc;

/// Creates, destroys and presents render buffers for one screen.
pub struct BufferManager {
    pub(super) device: Rc<dyn FramebufferDevice>,
    pub(super) page_flipping: bool,
    pub(super) flip_vsync: bool,
    pub(super) tracing: TracingConfig,
    pub(super) metrics: ScreenMetrics,
}

impl BufferManager {
    /// Create a manager for the screen driven by `device`.
    pub fn new(device: Rc<dyn FramebufferDevice>, config: &DriverConfig, screen: &str) -> Self {
        Self {
            device,
            page_flipping: config.page_flipping,
            flip_vsync: config.flip_vsync,
            tracing: TracingConfig::default(),
            metrics: ScreenMetrics::new(screen),
        }
    }

    /// Replace the tracing configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Whether flip buffers are handed out at all.
    pub fn page_flipping(&self) -> bool {
        self.page_flipping
    }

    /// Whether a buffer request takes the flip path.
    pub fn is_flip_eligible(
        &self,
        hooks: &dyn ServerHooks,
        drawable: &Drawable,
        attachment: Attachment,
    ) -> bool {
        self.page_flipping
            && drawable.is_window()
            && attachment.is_flip_pair()
            && hooks.can_flip(drawable)
    }

    /// Create the buffer for one attachment point of `drawable`.
    ///
    /// `format` is the depth for an offscreen buffer, 0 for the drawable's.
    ///
    /// # Errors
    ///
    /// - [`Error::Geometry`] if a flip buffer is requested but the virtual
    ///   screen is shorter than two pages.
    /// - [`Error::Device`] if the framebuffer cannot be named or panned.
    /// - [`Error::Allocation`] if an offscreen surface cannot be created.
    /// - [`Error::NotFound`] if the drawable's surface is unknown or has no
    ///   shared memory.
    ///
    /// Nothing is left referenced or allocated when an error is returned.
    pub fn create_buffer(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<BufferHandle> {
        let _span = self
            .tracing
            .buffer_spans
            .then(|| span_buffer("create", attachment).entered());

        let (buffer, path) = if self.is_flip_eligible(screen.hooks, drawable, attachment) {
            (
                self.create_flip_buffer(screen, drawable, attachment, format)?,
                BufferPath::Flip,
            )
        } else if attachment == Attachment::FrontLeft {
            screen.accel.reference_surface(drawable.surface)?;
            let surface = SurfaceRef::Borrowed(drawable.surface);
            (
                share_surface(screen.accel, surface, attachment, format)?,
                BufferPath::Front,
            )
        } else {
            let id = self.create_offscreen_surface(screen.accel, drawable, format)?;
            (
                share_surface(screen.accel, SurfaceRef::Owned(id), attachment, format)?,
                BufferPath::Offscreen,
            )
        };

        record_buffer_created(path);
        tracing::debug!(
            attachment = ?attachment,
            path = path.as_str(),
            name = %buffer.name,
            pitch = buffer.pitch,
            flags = buffer.flags,
            "created buffer"
        );
        Ok(buffer)
    }

    fn create_flip_buffer(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<BufferHandle> {
        let device = &*self.device;

        screen.geometry.require_flipping().inspect_err(|e| {
            tracing::error!(error = %e, "display does not have enough virtual height for flipping");
        })?;

        let (width, bits_per_pixel, pitch) = {
            let surface = screen.accel.get(drawable.surface)?;
            (surface.width(), surface.bits_per_pixel(), surface.pitch())
        };

        let name = device.ump_secure_id().inspect_err(|e| {
            record_device_failure("GET_UMP_SECURE_ID");
            tracing::error!(error = %e, "failed to retrieve framebuffer memory for flipping");
        })?;

        let flags = if attachment == Attachment::BackLeft {
            screen.geometry.back_page_offset()
        } else {
            0
        };

        screen.geometry.pan_to_back_page(device).inspect_err(|e| {
            record_device_failure("FBIOPUT_VSCREENINFO");
            tracing::error!(error = %e, "failed to pan to the back page");
        })?;

        screen.accel.reference_surface(drawable.surface)?;

        let pitch = if pitch == 0 {
            tracing::warn!("surface has no pitch, computing it from the width");
            min_pitch(width, bits_per_pixel).unwrap_or(0)
        } else {
            pitch
        };

        tracing::info!(
            pitch,
            flags,
            width = drawable.width,
            height = drawable.height,
            "enabled page flipping"
        );

        if let Err(e) = screen.geometry.refresh(device) {
            record_device_failure("FBIOGET_VSCREENINFO");
            tracing::warn!(error = %e, "failed to re-read screen description");
        }

        Ok(BufferHandle {
            attachment,
            pitch,
            cpp: bits_per_pixel / 8,
            name,
            flags,
            format,
            surface: SurfaceRef::Borrowed(drawable.surface),
            page_flipped: true,
        })
    }

    fn create_offscreen_surface(
        &self,
        accel: &mut Accel,
        drawable: &Drawable,
        format: u32,
    ) -> Result<SurfaceId> {
        let depth = if format != 0 { format } else { drawable.depth };
        let id = accel
            .create_surface(drawable.width, drawable.height, depth)
            .inspect_err(|e| {
                tracing::error!(error = %e, depth, "unable to allocate offscreen surface");
            })?;

        if let Err(e) = accel.ensure_backing(id) {
            tracing::error!(error = %e, "offscreen surface has no shared memory");
            accel.destroy_surface(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Destroy a buffer. `None` is ignored.
    ///
    /// Destroying a flip buffer pans the display back to the top page;
    /// device failures are logged and never abort the teardown.
    pub fn destroy_buffer(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        buffer: Option<BufferHandle>,
    ) {
        let Some(buffer) = buffer else {
            return;
        };
        let _span = self
            .tracing
            .buffer_spans
            .then(|| span_buffer("destroy", buffer.attachment).entered());

        if buffer.page_flipped {
            let device = &*self.device;
            if let Err(e) = screen.geometry.refresh(device) {
                record_device_failure("FBIOGET_VSCREENINFO");
                tracing::warn!(error = %e, "failed to read screen description");
            }
            screen.geometry.set_y_offset(0);
            if let Err(e) = screen.geometry.commit(device, FB_ACTIVATE_NOW) {
                record_device_failure("FBIOPUT_VSCREENINFO");
                tracing::warn!(error = %e, "failed to pan back to the top page");
            }
        }

        screen.accel.destroy_surface(buffer.surface());
        record_buffer_destroyed();
        tracing::debug!(
            drawable = %drawable.surface,
            attachment = ?buffer.attachment,
            owned = buffer.owns_surface(),
            "destroyed buffer"
        );
    }

    /// Create buffers for several attachments at once.
    ///
    /// Either every buffer is created or, on the first failure, the ones
    /// already created are destroyed and the error is returned.
    pub fn create_buffers(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        attachments: &[Attachment],
    ) -> Result<Vec<BufferHandle>> {
        let mut buffers = Vec::with_capacity(attachments.len());
        for &attachment in attachments {
            match self.create_buffer(screen, drawable, attachment, 0) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    while let Some(buffer) = buffers.pop() {
                        self.destroy_buffer(screen, drawable, Some(buffer));
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// Destroy several buffers at once.
    pub fn destroy_buffers(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        buffers: Vec<BufferHandle>,
    ) {
        for buffer in buffers {
            self.destroy_buffer(screen, drawable, Some(buffer));
        }
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("page_flipping", &self.page_flipping)
            .field("flip_vsync", &self.flip_vsync)
            .field("screen", &self.metrics.screen())
            .finish()
    }
}

/// Fill a non-flip buffer from its surface and hand the memory to the GPU.
///
/// Drops the surface reference again if the surface has no shared memory.
fn share_surface(
    accel: &mut Accel,
    surface: SurfaceRef,
    attachment: Attachment,
    format: u32,
) -> Result<BufferHandle> {
    let id = surface.id();
    let shared = {
        let surface = accel.get_mut(id)?;
        let (pitch, bits_per_pixel) = (surface.pitch(), surface.bits_per_pixel());
        let storage = surface.storage_mut();
        if !storage.is_framebuffer() {
            storage.set_gpu_access(true);
        }
        // Only memory the CPU has touched can hold dirty lines.
        storage.clean_for_gpu();
        storage
            .record()
            .map(|record| (pitch, bits_per_pixel, record.secure_id()))
    };

    let Some((pitch, bits_per_pixel, name)) = shared else {
        accel.destroy_surface(id);
        return Err(Error::NotFound(format!("{id} has no shared memory")));
    };

    Ok(BufferHandle {
        attachment,
        pitch,
        cpp: bits_per_pixel / 8,
        name,
        flags: 0,
        format,
        surface,
        page_flipped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dri::SoftwareServer;
    use crate::fbdev::{DisplayGeometry, FbOp, VirtualFramebuffer};
    use crate::memory::{MemfdBackend, UmpRegistry};

    struct Fixture {
        device: Rc<VirtualFramebuffer>,
        geometry: DisplayGeometry,
        accel: Accel,
        hooks: SoftwareServer,
        manager: BufferManager,
        window: Drawable,
    }

    impl Fixture {
        fn new(config: DriverConfig, yres_virtual: u32) -> Self {
            let backend = Rc::new(MemfdBackend::new());
            let device =
                Rc::new(VirtualFramebuffer::new(&backend, 64, 32, yres_virtual, 32).unwrap());
            let mut accel = Accel::new(UmpRegistry::open(backend), device.clone(), &config);
            let screen = accel.create_screen_surface(64, 32, 24, 32, 256).unwrap();
            let geometry = DisplayGeometry::query(&*device).unwrap();
            let manager = BufferManager::new(device.clone(), &config, "test");
            Self {
                device,
                geometry,
                accel,
                hooks: SoftwareServer::flippable(),
                manager,
                window: Drawable::window(screen, 64, 32, 24),
            }
        }

        fn create(&mut self, attachment: Attachment) -> Result<BufferHandle> {
            let mut screen = ScreenState {
                geometry: &mut self.geometry,
                accel: &mut self.accel,
                hooks: &self.hooks,
            };
            let window = self.window;
            self.manager.create_buffer(&mut screen, &window, attachment, 0)
        }

        fn destroy(&mut self, buffer: BufferHandle) {
            let mut screen = ScreenState {
                geometry: &mut self.geometry,
                accel: &mut self.accel,
                hooks: &self.hooks,
            };
            let window = self.window;
            self.manager.destroy_buffer(&mut screen, &window, Some(buffer));
        }

        fn refcnt(&self) -> u32 {
            self.accel.surface(self.window.surface).unwrap().refcnt()
        }
    }

    #[test]
    fn test_flip_back_buffer() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 64);
        let back = fx.create(Attachment::BackLeft).unwrap();

        assert!(back.is_page_flipped());
        assert!(!back.owns_surface());
        assert_eq!(back.flags, 256 * 32);
        assert_eq!(back.pitch, 256);
        assert_eq!(back.cpp, 4);
        assert_eq!(back.name, fx.device.secure_id());
        assert_eq!(fx.device.y_offset(), 32);
        assert_eq!(fx.geometry.y_offset(), 32);
        assert_eq!(fx.refcnt(), 2);

        fx.destroy(back);
        assert_eq!(fx.device.y_offset(), 0);
        assert_eq!(fx.refcnt(), 1);
    }

    #[test]
    fn test_flip_front_buffer_has_no_offset() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 64);
        let front = fx.create(Attachment::FrontLeft).unwrap();
        assert!(front.is_page_flipped());
        assert_eq!(front.flags, 0);
        fx.destroy(front);
    }

    #[test]
    fn test_flip_buffer_without_secure_id() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 64);
        let live = fx.accel.ump().stats().live();
        fx.device.fail(FbOp::SecureId);

        let err = fx.create(Attachment::BackLeft).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert_eq!(fx.refcnt(), 1);
        assert_eq!(fx.accel.ump().stats().live(), live);
        assert!(fx.device.commits().is_empty());
        assert_eq!(fx.geometry.y_offset(), 0);

        fx.device.recover(FbOp::SecureId);
        let back = fx.create(Attachment::BackLeft).unwrap();
        assert_eq!(fx.refcnt(), 2);
        fx.destroy(back);
    }

    #[test]
    fn test_insufficient_virtual_height() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 48);
        let live = fx.accel.ump().stats().live();

        let err = fx.create(Attachment::BackLeft).unwrap_err();
        assert!(matches!(
            err,
            Error::Geometry {
                needed: 64,
                available: 48
            }
        ));
        assert_eq!(fx.refcnt(), 1);
        assert_eq!(fx.accel.surfaces().len(), 1);
        assert_eq!(fx.accel.ump().stats().live(), live);
        assert!(fx.device.commits().is_empty());
    }

    #[test]
    fn test_flip_commit_failure_registers_nothing() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 64);
        fx.device.fail(FbOp::PutVar);
        assert!(matches!(
            fx.create(Attachment::BackLeft),
            Err(Error::Device(_))
        ));
        assert_eq!(fx.refcnt(), 1);
    }

    #[test]
    fn test_back_buffer_without_flipping_is_offscreen() {
        let mut fx = Fixture::new(DriverConfig::default(), 64);
        let back = fx.create(Attachment::BackLeft).unwrap();

        assert!(back.owns_surface());
        assert!(!back.is_page_flipped());
        assert_eq!(back.flags, 0);
        assert_ne!(back.surface(), fx.window.surface);
        assert_ne!(back.name, fx.device.secure_id());
        assert_eq!(back.pitch, 256);
        assert!(fx.accel.surface(back.surface()).unwrap().storage().gpu_access());
        assert_eq!(fx.accel.surfaces().len(), 2);

        fx.destroy(back);
        assert_eq!(fx.accel.surfaces().len(), 1);
    }

    #[test]
    fn test_front_buffer_borrows() {
        let mut fx = Fixture::new(DriverConfig::default(), 64);
        let a = fx.create(Attachment::FrontLeft).unwrap();
        let b = fx.create(Attachment::FrontLeft).unwrap();

        assert_eq!(fx.refcnt(), 3);
        assert_eq!(fx.accel.surfaces().len(), 1);
        assert_eq!(a.name, fx.device.secure_id());
        // The framebuffer never becomes GPU-dirty.
        let storage = fx.accel.surface(fx.window.surface).unwrap().storage();
        assert!(!storage.gpu_access());

        fx.destroy(a);
        fx.destroy(b);
        assert_eq!(fx.refcnt(), 1);
    }

    #[test]
    fn test_pixmap_never_flips() {
        let mut fx = Fixture::new(DriverConfig::flipping(), 64);
        let pixmap = fx.accel.create_surface(16, 16, 24).unwrap();
        let drawable = Drawable::pixmap(pixmap, 16, 16, 24);

        let mut screen = ScreenState {
            geometry: &mut fx.geometry,
            accel: &mut fx.accel,
            hooks: &fx.hooks,
        };
        let back = fx
            .manager
            .create_buffer(&mut screen, &drawable, Attachment::BackLeft, 0)
            .unwrap();
        assert!(!back.is_page_flipped());
        assert!(back.owns_surface());
        assert!(fx.device.commits().is_empty());
    }

    #[test]
    fn test_offscreen_format_overrides_depth() {
        let mut fx = Fixture::new(DriverConfig::default(), 64);
        let mut screen = ScreenState {
            geometry: &mut fx.geometry,
            accel: &mut fx.accel,
            hooks: &fx.hooks,
        };
        let window = fx.window;
        let depth = fx
            .manager
            .create_buffer(&mut screen, &window, Attachment::Depth, 16)
            .unwrap();
        assert_eq!(depth.cpp, 2);
        assert_eq!(depth.pitch, 128);
        assert_eq!(depth.format, 16);

        assert!(matches!(
            fx.manager
                .create_buffer(&mut screen, &window, Attachment::Depth, 12),
            Err(Error::Allocation(_))
        ));
    }

    #[test]
    fn test_batch_rolls_back() {
        let mut fx = Fixture::new(DriverConfig::default(), 64);
        let mut screen = ScreenState {
            geometry: &mut fx.geometry,
            accel: &mut fx.accel,
            hooks: &fx.hooks,
        };
        let window = fx.window;
        let zero = Drawable::window(window.surface, 0, 0, 24);

        // The offscreen back buffer of a zero-sized window has no memory.
        let err = fx
            .manager
            .create_buffers(&mut screen, &zero, &[Attachment::FrontLeft, Attachment::BackLeft])
            .unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        assert_eq!(fx.accel.surface(window.surface).unwrap().refcnt(), 1);
        assert_eq!(fx.accel.surfaces().len(), 1);
    }

    #[test]
    fn test_destroy_none_is_noop() {
        let mut fx = Fixture::new(DriverConfig::default(), 64);
        let mut screen = ScreenState {
            geometry: &mut fx.geometry,
            accel: &mut fx.accel,
            hooks: &fx.hooks,
        };
        let window = fx.window;
        fx.manager.destroy_buffer(&mut screen, &window, None);
        assert_eq!(fx.accel.surface(window.surface).unwrap().refcnt(), 1);
    }
}
