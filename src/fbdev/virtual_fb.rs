//! Memory-backed framebuffer device.
//!
//! Behaves like a display driver with a double-height virtual screen whose
//! memory lives in a memfd registered with a [`MemfdBackend`]. It records
//! every committed scan offset and vsync wait, and individual operations can
//! be made to fail to exercise degraded paths.

use super::{FB_ACTIVATE_NOW, FixScreenInfo, FramebufferDevice, VarScreenInfo};
use crate::error::{Error, Result};
use crate::memory::{MemfdBackend, SecureId};
use std::cell::{Cell, RefCell};

/// Device operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FbOp {
    /// `FBIOGET_VSCREENINFO`
    GetVar,
    /// `FBIOPUT_VSCREENINFO`
    PutVar,
    /// `FBIOGET_FSCREENINFO`
    GetFix,
    /// `FBIO_WAITFORVSYNC`
    WaitVsync,
    /// `GET_UMP_SECURE_ID`
    SecureId,
}

/// In-memory framebuffer device.
#[derive(Debug)]
pub struct VirtualFramebuffer {
    var: RefCell<VarScreenInfo>,
    fix: FixScreenInfo,
    secure_id: SecureId,
    failing: RefCell<Vec<FbOp>>,
    commits: RefCell<Vec<VarScreenInfo>>,
    vsync_waits: Cell<u32>,
}

impl VirtualFramebuffer {
    /// Create a device whose memory is registered with `backend`.
    pub fn new(
        backend: &MemfdBackend,
        xres: u32,
        yres: u32,
        yres_virtual: u32,
        bits_per_pixel: u32,
    ) -> Result<Self> {
        let mut device = Self::without_memory(xres, yres, yres_virtual, bits_per_pixel);

        let len = device.fix.smem_len as usize;
        let fd = rustix::fs::memfd_create("mali-fb", rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::Allocation(format!("framebuffer memfd_create failed: {e}")))?;
        rustix::fs::ftruncate(&fd, len as u64)?;
        device.secure_id = backend.import(fd, len)?;

        Ok(device)
    }

    /// Create a device that cannot share its memory (secure id lookups fail).
    pub fn without_memory(xres: u32, yres: u32, yres_virtual: u32, bits_per_pixel: u32) -> Self {
        let var = VarScreenInfo {
            xres,
            yres,
            xres_virtual: xres,
            yres_virtual,
            bits_per_pixel,
            activate: FB_ACTIVATE_NOW,
            ..Default::default()
        };

        let line_length = xres * bits_per_pixel / 8;
        let mut fix = FixScreenInfo {
            smem_len: line_length * yres_virtual,
            line_length,
            ypanstep: 1,
            ..Default::default()
        };
        fix.id[..10].copy_from_slice(b"virtual-fb");

        Self {
            var: RefCell::new(var),
            fix,
            secure_id: SecureId::INVALID,
            failing: RefCell::new(Vec::new()),
            commits: RefCell::new(Vec::new()),
            vsync_waits: Cell::new(0),
        }
    }

    /// Make `op` fail until [`recover`](Self::recover) is called.
    pub fn fail(&self, op: FbOp) {
        let mut failing = self.failing.borrow_mut();
        if !failing.contains(&op) {
            failing.push(op);
        }
    }

    /// Let `op` succeed again.
    pub fn recover(&self, op: FbOp) {
        self.failing.borrow_mut().retain(|o| *o != op);
    }

    /// Secure id of the framebuffer memory.
    pub fn secure_id(&self) -> SecureId {
        self.secure_id
    }

    /// Scan offset the display is currently showing.
    pub fn y_offset(&self) -> u32 {
        self.var.borrow().yoffset
    }

    /// Every successfully committed screen description, oldest first.
    pub fn commits(&self) -> Vec<VarScreenInfo> {
        self.commits.borrow().clone()
    }

    /// Scan offsets of every successful commit, oldest first.
    pub fn committed_offsets(&self) -> Vec<u32> {
        self.commits.borrow().iter().map(|v| v.yoffset).collect()
    }

    /// Number of completed vsync waits.
    pub fn vsync_waits(&self) -> u32 {
        self.vsync_waits.get()
    }

    fn check(&self, op: FbOp, name: &str) -> Result<()> {
        if self.failing.borrow().contains(&op) {
            Err(Error::device(name, std::io::Error::from_raw_os_error(libc::EIO)))
        } else {
            Ok(())
        }
    }
}

impl FramebufferDevice for VirtualFramebuffer {
    fn var_screen_info(&self) -> Result<VarScreenInfo> {
        self.check(FbOp::GetVar, "FBIOGET_VSCREENINFO")?;
        Ok(*self.var.borrow())
    }

    fn put_var_screen_info(&self, var: &VarScreenInfo) -> Result<VarScreenInfo> {
        self.check(FbOp::PutVar, "FBIOPUT_VSCREENINFO")?;

        let current = *self.var.borrow();
        if var.yoffset.saturating_add(current.yres) > current.yres_virtual {
            return Err(Error::device(
                "FBIOPUT_VSCREENINFO",
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }

        // Only panning is emulated; the mode stays fixed.
        let mut next = current;
        next.xoffset = var.xoffset;
        next.yoffset = var.yoffset;
        next.activate = var.activate;
        *self.var.borrow_mut() = next;
        self.commits.borrow_mut().push(next);
        Ok(next)
    }

    fn fix_screen_info(&self) -> Result<FixScreenInfo> {
        self.check(FbOp::GetFix, "FBIOGET_FSCREENINFO")?;
        Ok(self.fix)
    }

    fn wait_for_vsync(&self) -> Result<()> {
        self.check(FbOp::WaitVsync, "FBIO_WAITFORVSYNC")?;
        self.vsync_waits.set(self.vsync_waits.get() + 1);
        Ok(())
    }

    fn ump_secure_id(&self) -> Result<SecureId> {
        self.check(FbOp::SecureId, "GET_UMP_SECURE_ID")?;
        if !self.secure_id.is_valid() {
            return Err(Error::Device(
                "GET_UMP_SECURE_ID returned the invalid secure id".into(),
            ));
        }
        Ok(self.secure_id)
    }
}
