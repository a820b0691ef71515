//! The session's view of the display's virtual screen.

use super::{FB_ACTIVATE_NOW, FramebufferDevice, VarScreenInfo};
use crate::error::{Error, Result};

/// Snapshot of the device's virtual screen description.
///
/// A flip-capable display has a virtual framebuffer at least twice as tall as
/// the visible one. The top page starts at `yoffset = 0`, the bottom page at
/// `yoffset = yres`; flipping changes `yoffset` instead of copying pixels.
///
/// The snapshot is owned by the driver session and only changed through
/// `&mut` by the buffer manager and the flip coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayGeometry {
    var: VarScreenInfo,
}

impl DisplayGeometry {
    /// Wrap a screen description.
    pub fn new(var: VarScreenInfo) -> Self {
        Self { var }
    }

    /// Read the current description from the device.
    pub fn query(device: &dyn FramebufferDevice) -> Result<Self> {
        Ok(Self::new(device.var_screen_info()?))
    }

    /// The raw screen description.
    #[inline]
    pub fn var(&self) -> &VarScreenInfo {
        &self.var
    }

    /// Visible height in lines.
    #[inline]
    pub fn visible_height(&self) -> u32 {
        self.var.yres
    }

    /// Virtual height in lines.
    #[inline]
    pub fn virtual_height(&self) -> u32 {
        self.var.yres_virtual
    }

    /// Current vertical scan offset.
    #[inline]
    pub fn y_offset(&self) -> u32 {
        self.var.yoffset
    }

    /// Set the vertical scan offset (not committed).
    pub fn set_y_offset(&mut self, yoffset: u32) {
        self.var.yoffset = yoffset;
    }

    /// Bytes per line of the virtual framebuffer.
    pub fn line_stride(&self) -> u32 {
        self.var.xres_virtual * self.var.bits_per_pixel / 8
    }

    /// Byte offset of the second virtual page.
    ///
    /// For 1366×768 at 32 bpp with a 1366×1536 virtual screen this is
    /// 4,194,432.
    pub fn back_page_offset(&self) -> u32 {
        self.line_stride() * self.var.yres
    }

    /// Whether the virtual screen holds two full pages.
    pub fn supports_flipping(&self) -> bool {
        self.var.yres_virtual >= self.var.yres.saturating_mul(2)
    }

    /// Fail with [`Error::Geometry`] unless the virtual screen holds two pages.
    pub fn require_flipping(&self) -> Result<()> {
        if self.supports_flipping() {
            Ok(())
        } else {
            Err(Error::Geometry {
                needed: self.var.yres.saturating_mul(2),
                available: self.var.yres_virtual,
            })
        }
    }

    /// Move the scan offset to the other page and return it (not committed).
    ///
    /// From a page-aligned offset the result is `0` or `yres`; it is always
    /// below `2 * yres`.
    pub fn advance_flip(&mut self) -> u32 {
        let yres = self.var.yres;
        self.var.yoffset = self
            .var
            .yoffset
            .wrapping_add(yres)
            .checked_rem(yres.wrapping_mul(2))
            .unwrap_or(0);
        self.var.yoffset
    }

    /// Replace the snapshot with what the device reports.
    pub fn refresh(&mut self, device: &dyn FramebufferDevice) -> Result<()> {
        self.var = device.var_screen_info()?;
        Ok(())
    }

    /// Write the snapshot to the device with the given `FB_ACTIVATE_*` mode
    /// and keep the description the device applied.
    pub fn commit(&mut self, device: &dyn FramebufferDevice, activate: u32) -> Result<()> {
        self.var.activate = activate;
        self.var = device.put_var_screen_info(&self.var)?;
        Ok(())
    }

    /// Re-read the device, move the scan offset to the bottom page and commit
    /// it immediately.
    pub fn pan_to_back_page(&mut self, device: &dyn FramebufferDevice) -> Result<()> {
        self.refresh(device)?;
        self.var.yoffset = self.var.yres;
        self.commit(device, FB_ACTIVATE_NOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(yres: u32, yres_virtual: u32) -> DisplayGeometry {
        DisplayGeometry::new(VarScreenInfo {
            xres: 1366,
            yres,
            xres_virtual: 1366,
            yres_virtual,
            bits_per_pixel: 32,
            ..Default::default()
        })
    }

    #[test]
    fn test_back_page_offset() {
        let geometry = geometry(768, 1536);
        assert_eq!(geometry.line_stride(), 1366 * 4);
        assert_eq!(geometry.back_page_offset(), 4_194_432);
    }

    #[test]
    fn test_flip_cycle() {
        let mut geometry = geometry(768, 1536);
        assert_eq!(geometry.advance_flip(), 768);
        assert_eq!(geometry.advance_flip(), 0);

        for k in 1..=9u32 {
            let offset = geometry.advance_flip();
            assert_eq!(offset, (k % 2) * 768);
            assert!(offset < 2 * 768);
        }
    }

    #[test]
    fn test_flip_from_odd_offset_stays_in_range() {
        let mut geometry = geometry(768, 1536);
        geometry.set_y_offset(1000);
        assert!(geometry.advance_flip() < 2 * 768);
    }

    #[test]
    fn test_zero_height_does_not_panic() {
        let mut geometry = geometry(0, 0);
        assert_eq!(geometry.advance_flip(), 0);
    }

    #[test]
    fn test_require_flipping() {
        assert!(geometry(768, 1536).require_flipping().is_ok());
        assert!(geometry(768, 2048).supports_flipping());

        match geometry(768, 1000).require_flipping() {
            Err(Error::Geometry { needed, available }) => {
                assert_eq!(needed, 1536);
                assert_eq!(available, 1000);
            }
            other => panic!("expected geometry error, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_keeps_applied_description() {
        let device = crate::fbdev::VirtualFramebuffer::without_memory(64, 32, 64, 32);
        let mut geometry = geometry(32, 64);
        geometry.set_y_offset(32);
        geometry.commit(&device, FB_ACTIVATE_NOW).unwrap();

        // The device only pans; the requested mode is replaced by its own.
        assert_eq!(geometry.var().xres, 64);
        assert_eq!(geometry.y_offset(), 32);
        assert_eq!(geometry.var(), &device.var_screen_info().unwrap());
    }

    #[test]
    fn test_pan_to_back_page() {
        let device = crate::fbdev::VirtualFramebuffer::without_memory(64, 32, 64, 32);
        let mut geometry = DisplayGeometry::query(&device).unwrap();
        geometry.pan_to_back_page(&device).unwrap();
        assert_eq!(geometry.y_offset(), 32);
        assert_eq!(device.committed_offsets(), vec![32]);
        assert_eq!(device.commits()[0].activate, FB_ACTIVATE_NOW);
    }
}
