use super::{Attachment, BufferHandle, BufferManager, ScreenState};
use crate::fbdev::{DisplayGeometry, FB_ACTIVATE_NOW, FB_ACTIVATE_VBL};
use crate::observability::{record_device_failure, span_present};
use crate::region::{BoxRect, Region};
use crate::surface::Drawable;

/// What a present request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The display now scans out from `y_offset`.
    Flipped {
        /// New vertical scan offset.
        y_offset: u32,
    },
    /// The region was copied from the source to the destination buffer.
    Copied,
    /// Nothing to do: one side is a client-side fake front buffer.
    Skipped,
}

impl BufferManager {
    /// Make the contents of `src` inside `region` visible in `dst`.
    ///
    /// Two flip buffers are swapped by moving the scan offset to the other
    /// page. Anything else is copied, clipped to the drawable. Device and
    /// copy failures are logged; the request itself never fails.
    pub fn present(
        &self,
        screen: &mut ScreenState<'_>,
        drawable: &Drawable,
        region: &Region,
        dst: &BufferHandle,
        src: &BufferHandle,
    ) -> PresentOutcome {
        let _span = self
            .tracing
            .present_spans
            .then(|| span_present(dst.attachment, src.attachment).entered());

        if dst.page_flipped && src.page_flipped {
            let y_offset = self.flip(screen.geometry);
            self.metrics.record_flip();
            return PresentOutcome::Flipped { y_offset };
        }

        if src.attachment == Attachment::FakeFrontLeft || dst.attachment == Attachment::FakeFrontLeft {
            self.metrics.record_skip();
            return PresentOutcome::Skipped;
        }

        let surface_of = |buffer: &BufferHandle| {
            if buffer.attachment == Attachment::FrontLeft {
                drawable.surface
            } else {
                buffer.surface()
            }
        };
        let (from, to) = (surface_of(src), surface_of(dst));

        let region = region.clipped(&BoxRect::from_size(drawable.width, drawable.height));
        if let Err(e) = screen.hooks.copy_region(screen.accel, from, to, &region) {
            tracing::warn!(src = %from, dst = %to, error = %e, "region copy failed");
        }
        self.metrics.record_copy();
        PresentOutcome::Copied
    }

    /// Move the display to the other page and return the new scan offset.
    fn flip(&self, geometry: &mut DisplayGeometry) -> u32 {
        let device = &*self.device;
        let y_offset = geometry.advance_flip();
        let activate = if self.flip_vsync {
            FB_ACTIVATE_VBL
        } else {
            FB_ACTIVATE_NOW
        };

        let committed = match geometry.commit(device, activate) {
            Ok(()) => true,
            Err(e) => {
                record_device_failure("FBIOPUT_VSCREENINFO");
                tracing::warn!(y_offset, error = %e, "failed to flip");
                false
            }
        };

        if self.flip_vsync {
            if let Err(e) = device.wait_for_vsync() {
                record_device_failure("FBIO_WAITFORVSYNC");
                tracing::warn!(error = %e, "failed to wait for vertical blank");
            }
        }

        if committed {
            if let Err(e) = geometry.refresh(device) {
                record_device_failure("FBIOGET_VSCREENINFO");
                tracing::warn!(error = %e, "failed to re-read screen description");
            }
        }

        tracing::trace!(y_offset, "flipped");
        y_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::Accel;
    use crate::config::DriverConfig;
    use crate::dri::{ServerHooks, SoftwareServer};
    use crate::error::Result;
    use crate::fbdev::{FbOp, VirtualFramebuffer};
    use crate::memory::{MemfdBackend, UmpRegistry};
    use crate::surface::SurfaceId;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingServer {
        copies: RefCell<Vec<(SurfaceId, SurfaceId, Region)>>,
    }

    impl ServerHooks for RecordingServer {
        fn can_flip(&self, _drawable: &Drawable) -> bool {
            true
        }

        fn copy_region(
            &self,
            _accel: &mut Accel,
            src: SurfaceId,
            dst: SurfaceId,
            region: &Region,
        ) -> Result<()> {
            self.copies.borrow_mut().push((src, dst, region.clone()));
            Ok(())
        }
    }

    fn setup(config: &DriverConfig) -> (Rc<VirtualFramebuffer>, DisplayGeometry, Accel, Drawable) {
        let backend = Rc::new(MemfdBackend::new());
        let device = Rc::new(VirtualFramebuffer::new(&backend, 64, 32, 64, 32).unwrap());
        let mut accel = Accel::new(UmpRegistry::open(backend), device.clone(), config);
        let screen = accel.create_screen_surface(64, 32, 24, 32, 256).unwrap();
        let geometry = DisplayGeometry::query(&*device).unwrap();
        (device, geometry, accel, Drawable::window(screen, 64, 32, 24))
    }

    #[test]
    fn test_flip_cycles_between_pages() {
        let config = DriverConfig::flipping().with_flip_vsync(false);
        let (device, mut geometry, mut accel, window) = setup(&config);
        let hooks = SoftwareServer::flippable();
        let manager = BufferManager::new(device.clone(), &config, "test");
        let mut screen = ScreenState {
            geometry: &mut geometry,
            accel: &mut accel,
            hooks: &hooks,
        };

        let front = manager
            .create_buffer(&mut screen, &window, Attachment::FrontLeft, 0)
            .unwrap();
        let back = manager
            .create_buffer(&mut screen, &window, Attachment::BackLeft, 0)
            .unwrap();
        assert_eq!(screen.geometry.y_offset(), 32);

        let region = Region::from_rect(BoxRect::from_size(64, 32));
        for expected in [0, 32, 0, 32] {
            let outcome = manager.present(&mut screen, &window, &region, &front, &back);
            assert_eq!(outcome, PresentOutcome::Flipped { y_offset: expected });
            assert_eq!(device.y_offset(), expected);
        }
        assert_eq!(device.vsync_waits(), 0);
        assert_eq!(device.commits().last().unwrap().activate, FB_ACTIVATE_NOW);
    }

    #[test]
    fn test_vsync_gated_flip() {
        let config = DriverConfig::flipping();
        let (device, mut geometry, mut accel, window) = setup(&config);
        let hooks = SoftwareServer::flippable();
        let manager = BufferManager::new(device.clone(), &config, "test");
        let mut screen = ScreenState {
            geometry: &mut geometry,
            accel: &mut accel,
            hooks: &hooks,
        };

        let front = manager
            .create_buffer(&mut screen, &window, Attachment::FrontLeft, 0)
            .unwrap();
        let back = manager
            .create_buffer(&mut screen, &window, Attachment::BackLeft, 0)
            .unwrap();

        device.fail(FbOp::WaitVsync);
        let outcome = manager.present(&mut screen, &window, &Region::new(), &front, &back);
        assert_eq!(outcome, PresentOutcome::Flipped { y_offset: 0 });
        assert_eq!(device.commits().last().unwrap().activate, FB_ACTIVATE_VBL);

        device.recover(FbOp::WaitVsync);
        manager.present(&mut screen, &window, &Region::new(), &front, &back);
        assert_eq!(device.vsync_waits(), 1);
    }

    #[test]
    fn test_failed_commit_keeps_offset_advanced() {
        let config = DriverConfig::flipping().with_flip_vsync(false);
        let (device, mut geometry, mut accel, window) = setup(&config);
        let hooks = SoftwareServer::flippable();
        let manager = BufferManager::new(device.clone(), &config, "test");
        let mut screen = ScreenState {
            geometry: &mut geometry,
            accel: &mut accel,
            hooks: &hooks,
        };
        let front = manager
            .create_buffer(&mut screen, &window, Attachment::FrontLeft, 0)
            .unwrap();
        let back = manager
            .create_buffer(&mut screen, &window, Attachment::BackLeft, 0)
            .unwrap();

        device.fail(FbOp::PutVar);
        let outcome = manager.present(&mut screen, &window, &Region::new(), &front, &back);
        assert_eq!(outcome, PresentOutcome::Flipped { y_offset: 0 });
        assert_eq!(screen.geometry.y_offset(), 0);
        assert_eq!(device.y_offset(), 32);
    }

    #[test]
    fn test_fake_front_is_skipped() {
        let config = DriverConfig::default();
        let (device, mut geometry, mut accel, window) = setup(&config);
        let hooks = RecordingServer::default();
        let manager = BufferManager::new(device, &config, "test");
        let mut screen = ScreenState {
            geometry: &mut geometry,
            accel: &mut accel,
            hooks: &hooks,
        };

        let fake = manager
            .create_buffer(&mut screen, &window, Attachment::FakeFrontLeft, 0)
            .unwrap();
        let front = manager
            .create_buffer(&mut screen, &window, Attachment::FrontLeft, 0)
            .unwrap();

        let region = Region::from_rect(BoxRect::from_size(8, 8));
        assert_eq!(
            manager.present(&mut screen, &window, &region, &front, &fake),
            PresentOutcome::Skipped
        );
        assert_eq!(
            manager.present(&mut screen, &window, &region, &fake, &front),
            PresentOutcome::Skipped
        );
        assert!(hooks.copies.borrow().is_empty());
    }

    #[test]
    fn test_copy_targets_drawable_for_front() {
        let config = DriverConfig::default();
        let (device, mut geometry, mut accel, window) = setup(&config);
        let hooks = RecordingServer::default();
        let manager = BufferManager::new(device, &config, "test");
        let mut screen = ScreenState {
            geometry: &mut geometry,
            accel: &mut accel,
            hooks: &hooks,
        };

        let front = manager
            .create_buffer(&mut screen, &window, Attachment::FrontLeft, 0)
            .unwrap();
        let back = manager
            .create_buffer(&mut screen, &window, Attachment::BackLeft, 0)
            .unwrap();

        let region = Region::from_rect(BoxRect::new(-8, 16, 80, 40));
        let outcome = manager.present(&mut screen, &window, &region, &front, &back);
        assert_eq!(outcome, PresentOutcome::Copied);

        let copies = hooks.copies.borrow();
        assert_eq!(copies.len(), 1);
        let (src, dst, clipped) = &copies[0];
        assert_eq!(*src, back.surface());
        assert_eq!(*dst, window.surface);
        assert_eq!(clipped.rects(), &[BoxRect::new(0, 16, 64, 32)]);
    }
}
