//! Software region copy between two surfaces.

use super::Accel;
use crate::error::{Error, Result};
use crate::region::{BoxRect, Region};
use crate::surface::SurfaceId;

#[derive(Clone, Copy)]
struct Layout {
    width: u32,
    height: u32,
    pitch: usize,
    bits_per_pixel: u32,
    len: usize,
}

fn layout(accel: &Accel, id: SurfaceId) -> Result<Layout> {
    let surface = accel.get(id)?;
    Ok(Layout {
        width: surface.width,
        height: surface.height,
        pitch: surface.pitch as usize,
        bits_per_pixel: surface.bits_per_pixel,
        len: surface.storage.record.as_ref().map_or(0, |r| r.byte_size),
    })
}

/// Copy the pixels of `region` from `src` to `dst` at the same coordinates.
///
/// The region is clipped to both surfaces. Both surfaces are bracketed with
/// access windows, so caches are maintained as for any CPU rendering.
pub fn copy_region(accel: &mut Accel, src: SurfaceId, dst: SurfaceId, region: &Region) -> Result<()> {
    let from = layout(accel, src)?;
    let to = layout(accel, dst)?;

    if from.bits_per_pixel != to.bits_per_pixel || from.bits_per_pixel < 8 {
        return Err(Error::Unsupported(format!(
            "copy from {} bpp to {} bpp",
            from.bits_per_pixel, to.bits_per_pixel
        )));
    }
    let cpp = (from.bits_per_pixel / 8) as usize;

    let bounds = BoxRect::from_size(from.width.min(to.width), from.height.min(to.height));
    let region = region.clipped(&bounds);
    if region.is_empty() {
        return Ok(());
    }

    let src_ptr = accel.prepare_access(src)?;
    let dst_ptr = match accel.prepare_access(dst) {
        Ok(ptr) => ptr,
        Err(e) => {
            accel.finish_access(src);
            return Err(e);
        }
    };

    for rect in region.rects() {
        let x = rect.x1 as usize * cpp;
        let n = rect.width() as usize * cpp;
        for y in rect.y1..rect.y2 {
            let y = y as usize;
            let src_off = y * from.pitch + x;
            let dst_off = y * to.pitch + x;
            if src_off + n > from.len || dst_off + n > to.len {
                continue;
            }
            // SAFETY: both ranges were checked against the mapped sizes; copy
            // allows overlap when src and dst are the same surface.
            unsafe {
                std::ptr::copy(
                    src_ptr.as_ptr().add(src_off),
                    dst_ptr.as_ptr().add(dst_off),
                    n,
                );
            }
        }
    }

    accel.finish_access(dst);
    accel.finish_access(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::fbdev::VirtualFramebuffer;
    use crate::memory::{MemfdBackend, UmpRegistry};
    use std::rc::Rc;

    fn accel() -> Accel {
        let backend = Rc::new(MemfdBackend::new());
        let device = Rc::new(VirtualFramebuffer::new(&backend, 16, 16, 32, 32).unwrap());
        Accel::new(UmpRegistry::open(backend), device, &DriverConfig::default())
    }

    #[test]
    fn test_copy_clipped_box() {
        let mut accel = accel();
        let src = accel.create_surface(8, 8, 24).unwrap();
        let dst = accel.create_surface(4, 4, 24).unwrap();

        accel.access(src).unwrap().as_mut_slice().fill(0x11);

        let region = Region::from_rect(BoxRect::new(2, 2, 8, 8));
        copy_region(&mut accel, src, dst, &region).unwrap();

        let window = accel.access(dst).unwrap();
        let bytes = window.as_slice();
        let pitch = 16;
        // Row 1 is outside the region, row 2 columns 2..4 are inside.
        assert!(bytes[pitch..2 * pitch].iter().all(|b| *b == 0));
        assert_eq!(&bytes[2 * pitch..2 * pitch + 8], &[0; 8]);
        assert_eq!(&bytes[2 * pitch + 8..3 * pitch], &[0x11; 8]);
    }

    #[test]
    fn test_bpp_mismatch() {
        let mut accel = accel();
        let src = accel.create_surface(4, 4, 24).unwrap();
        let dst = accel.create_surface(4, 4, 16).unwrap();
        let region = Region::from_rect(BoxRect::from_size(4, 4));
        assert!(matches!(
            copy_region(&mut accel, src, dst, &region),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_failed_destination_closes_source_window() {
        let mut accel = accel();
        let src = accel.create_surface(4, 4, 24).unwrap();
        let dst = accel.create_surface(4, 4, 24).unwrap();
        accel.destroy_surface_storage(dst);

        let region = Region::from_rect(BoxRect::from_size(4, 4));
        assert!(copy_region(&mut accel, src, dst, &region).is_err());
        assert_eq!(accel.surface(src).unwrap().storage().refs(), 0);
    }
}
