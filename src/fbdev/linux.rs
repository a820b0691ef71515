//! Linux `/dev/fbN` device.

use super::{
    FBIO_WAITFORVSYNC, FBIOGET_FSCREENINFO, FBIOGET_VSCREENINFO, FBIOPUT_VSCREENINFO,
    FixScreenInfo, FramebufferDevice, GET_UMP_SECURE_ID, VarScreenInfo,
};
use crate::error::{Error, Result};
use crate::memory::SecureId;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};

/// An open framebuffer device node.
///
/// The display driver must expose the `GET_UMP_SECURE_ID` ioctl for the
/// framebuffer memory to be shareable with the GPU.
#[derive(Debug)]
pub struct FbDev {
    fd: OwnedFd,
    path: PathBuf,
}

impl FbDev {
    /// Open a framebuffer device node read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::device(&format!("open {}", path.display()), e))?;
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue an ioctl whose argument is a pointer to `T`.
    ///
    /// # Safety
    ///
    /// `request` must be a command that reads and/or writes exactly one `T`.
    unsafe fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> std::io::Result<()> {
        // SAFETY: fd is open; caller guarantees the command matches T.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl FramebufferDevice for FbDev {
    fn var_screen_info(&self) -> Result<VarScreenInfo> {
        let mut var = VarScreenInfo::default();
        // SAFETY: FBIOGET_VSCREENINFO fills a struct fb_var_screeninfo.
        unsafe { self.ioctl(FBIOGET_VSCREENINFO, &mut var) }
            .map_err(|e| Error::device("FBIOGET_VSCREENINFO", e))?;
        Ok(var)
    }

    fn put_var_screen_info(&self, var: &VarScreenInfo) -> Result<VarScreenInfo> {
        let mut var = *var;
        // SAFETY: FBIOPUT_VSCREENINFO reads and writes a struct fb_var_screeninfo.
        unsafe { self.ioctl(FBIOPUT_VSCREENINFO, &mut var) }
            .map_err(|e| Error::device("FBIOPUT_VSCREENINFO", e))?;
        // The kernel rounds the request to what the mode supports.
        Ok(var)
    }

    fn fix_screen_info(&self) -> Result<FixScreenInfo> {
        let mut fix = FixScreenInfo::default();
        // SAFETY: FBIOGET_FSCREENINFO fills a struct fb_fix_screeninfo.
        unsafe { self.ioctl(FBIOGET_FSCREENINFO, &mut fix) }
            .map_err(|e| Error::device("FBIOGET_FSCREENINFO", e))?;
        Ok(fix)
    }

    fn wait_for_vsync(&self) -> Result<()> {
        let mut crtc: u32 = 0;
        // SAFETY: FBIO_WAITFORVSYNC reads a __u32 crtc index.
        unsafe { self.ioctl(FBIO_WAITFORVSYNC, &mut crtc) }
            .map_err(|e| Error::device("FBIO_WAITFORVSYNC", e))
    }

    fn ump_secure_id(&self) -> Result<SecureId> {
        let mut id: u32 = SecureId::INVALID.0;
        // SAFETY: GET_UMP_SECURE_ID writes an unsigned int.
        unsafe { self.ioctl(GET_UMP_SECURE_ID, &mut id) }
            .map_err(|e| Error::device("GET_UMP_SECURE_ID", e))?;

        let id = SecureId(id);
        if !id.is_valid() {
            return Err(Error::Device(
                "GET_UMP_SECURE_ID returned the invalid secure id".into(),
            ));
        }
        Ok(id)
    }
}

impl AsFd for FbDev {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = FbDev::open("/nonexistent/fb7").unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }

    #[test]
    fn test_ioctl_on_regular_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dev = FbDev::open(file.path()).unwrap();
        assert_eq!(dev.path(), file.path());

        assert!(matches!(dev.var_screen_info(), Err(Error::Device(_))));
        assert!(matches!(dev.wait_for_vsync(), Err(Error::Device(_))));
        assert!(matches!(dev.ump_secure_id(), Err(Error::Device(_))));
    }
}
