//! Framebuffer display device interface.
//!
//! The driver talks to the display controller through a handful of
//! ioctl-style calls: read and write the virtual screen description, wait for
//! vertical blank, and ask for the secure id of the framebuffer memory.
//!
//! - [`FramebufferDevice`]: the calls as a trait
//! - [`FbDev`]: Linux `/dev/fbN` implementation
//! - [`VirtualFramebuffer`]: memory-backed device for headless sessions and tests
//! - [`DisplayGeometry`]: the session's snapshot of the screen description

mod geometry;
mod linux;
mod virtual_fb;

pub use geometry::DisplayGeometry;
pub use linux::FbDev;
pub use virtual_fb::{FbOp, VirtualFramebuffer};

use crate::error::Result;
use crate::memory::SecureId;

/// `FBIOGET_VSCREENINFO`
pub const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
/// `FBIOPUT_VSCREENINFO`
pub const FBIOPUT_VSCREENINFO: libc::c_ulong = 0x4601;
/// `FBIOGET_FSCREENINFO`
pub const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;
/// `FBIO_WAITFORVSYNC`: `_IOW('F', 0x20, __u32)`
pub const FBIO_WAITFORVSYNC: libc::c_ulong = 0x4004_4620;
/// `GET_UMP_SECURE_ID`: `_IOWR('m', 310, unsigned int)`.
///
/// The command number overflows into the type byte; this is the value the
/// display driver registers, so it is kept as is.
pub const GET_UMP_SECURE_ID: libc::c_ulong = 0xc004_6e36;

/// Apply the new screen description immediately.
pub const FB_ACTIVATE_NOW: u32 = 0;
/// Apply the new screen description at the next vertical blank.
pub const FB_ACTIVATE_VBL: u32 = 16;

/// `struct fb_bitfield`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbBitfield {
    /// Beginning of the bitfield.
    pub offset: u32,
    /// Length of the bitfield.
    pub length: u32,
    /// Most significant bit is on the right.
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo`: the mutable screen description.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VarScreenInfo {
    /// Visible width.
    pub xres: u32,
    /// Visible height.
    pub yres: u32,
    /// Virtual width.
    pub xres_virtual: u32,
    /// Virtual height.
    pub yres_virtual: u32,
    /// Horizontal offset from virtual to visible.
    pub xoffset: u32,
    /// Vertical offset from virtual to visible.
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    /// `FB_ACTIVATE_*`
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo`: the fixed memory layout of the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FixScreenInfo {
    pub id: [u8; 16],
    /// Physical start of framebuffer memory.
    pub smem_start: libc::c_ulong,
    /// Length of framebuffer memory.
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    /// Bytes per line.
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

impl FixScreenInfo {
    /// Device identification string.
    pub fn id_str(&self) -> &str {
        let end = self.id.iter().position(|b| *b == 0).unwrap_or(self.id.len());
        std::str::from_utf8(&self.id[..end]).unwrap_or("")
    }
}

/// A framebuffer display device.
///
/// All calls are synchronous; `wait_for_vsync` blocks for at most one frame.
pub trait FramebufferDevice {
    /// `FBIOGET_VSCREENINFO`
    fn var_screen_info(&self) -> Result<VarScreenInfo>;

    /// `FBIOPUT_VSCREENINFO`
    ///
    /// Returns the description as the device applied it.
    fn put_var_screen_info(&self, var: &VarScreenInfo) -> Result<VarScreenInfo>;

    /// `FBIOGET_FSCREENINFO`
    fn fix_screen_info(&self) -> Result<FixScreenInfo>;

    /// `FBIO_WAITFORVSYNC`
    fn wait_for_vsync(&self) -> Result<()>;

    /// Secure id of the framebuffer memory.
    ///
    /// Devices report failure with [`SecureId::INVALID`]; implementations turn
    /// that into an error.
    fn ump_secure_id(&self) -> Result<SecureId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_screeninfo_layout() {
        // 40 u32 words in the kernel ABI.
        assert_eq!(std::mem::size_of::<VarScreenInfo>(), 160);
    }

    #[test]
    fn test_ioctl_numbers() {
        // _IOC(dir, type, nr, size) = dir << 30 | size << 16 | type << 8 | nr
        let iow = (1u64 << 30) | (4 << 16) | ((b'F' as u64) << 8) | 0x20;
        assert_eq!(FBIO_WAITFORVSYNC as u64, iow);

        let iowr = (3u64 << 30) | (4 << 16) | (((b'm' as u64) << 8) + 310);
        assert_eq!(GET_UMP_SECURE_ID as u64, iowr);
    }

    #[test]
    fn test_fix_id_str() {
        let mut fix = FixScreenInfo::default();
        fix.id[..6].copy_from_slice(b"mxc_fb");
        assert_eq!(fix.id_str(), "mxc_fb");
    }
}
