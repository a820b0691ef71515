//! Adapting to the server's buffer-management interface.
//!
//! The server's extension comes in several versions. The core only knows one
//! interface ([`BufferManager`](super::BufferManager)); everything that
//! depends on the version the server offers is decided here, once, at screen
//! setup:
//!
//! - the extension must be at least 1.1,
//! - info records of version 1 register the batched
//!   `create_buffers`/`destroy_buffers` hooks, later versions the single-buffer
//!   ones,
//! - clients need the path of the DRM device node the driver opened.

use crate::error::{Error, Result};
use rustix::fd::AsFd;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name the driver registers with the server.
pub const DRIVER_NAME: &str = "Mali DRI2";

/// Directory holding DRM device nodes.
pub const DRM_DIR_NAME: &str = "/dev/dri";

/// Number of DRM minors probed when looking up a device node.
pub const DRM_MAX_MINOR: u32 = 16;

/// Version of the server's buffer-management extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dri2Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl Dri2Version {
    /// Oldest extension version the driver works with.
    pub const MINIMUM: Dri2Version = Dri2Version { major: 1, minor: 1 };

    /// Create a version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Fail with [`Error::Unsupported`] if older than [`MINIMUM`](Self::MINIMUM).
    pub fn require_supported(self) -> Result<()> {
        if self < Self::MINIMUM {
            return Err(Error::Unsupported(format!(
                "DRI2 module version {self} is older than {}",
                Self::MINIMUM
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Dri2Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Layout of the info record the driver hands to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoRecVersion {
    /// Batched `create_buffers`/`destroy_buffers`.
    V1,
    /// Single-buffer `create_buffer`/`destroy_buffer`.
    V2,
    /// As V2, with the extended buffer fields.
    V3,
}

impl InfoRecVersion {
    /// Decode the server's info record version. Unknown newer versions map
    /// to the latest known layout.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Err(Error::Unsupported("info record version 0".into())),
            1 => Ok(InfoRecVersion::V1),
            2 => Ok(InfoRecVersion::V2),
            _ => Ok(InfoRecVersion::V3),
        }
    }

    /// The version number.
    pub fn as_raw(self) -> u32 {
        match self {
            InfoRecVersion::V1 => 1,
            InfoRecVersion::V2 => 2,
            InfoRecVersion::V3 => 3,
        }
    }

    /// Whether buffers are created and destroyed in batches.
    pub fn batched(self) -> bool {
        self == InfoRecVersion::V1
    }
}

/// What the driver registers with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dri2Info {
    /// Driver name reported to clients.
    pub driver_name: &'static str,
    /// DRM device node clients open.
    pub device_name: PathBuf,
    /// Record layout.
    pub version: InfoRecVersion,
}

/// Check the server's extension version and describe the driver to it.
///
/// `drm` is the DRM device the driver opened; its node is looked up under
/// [`DRM_DIR_NAME`].
pub fn negotiate(server: Dri2Version, info: InfoRecVersion, drm: impl AsFd) -> Result<Dri2Info> {
    server.require_supported().inspect_err(|e| {
        tracing::error!(error = %e, "buffer management requires DRI2 1.1.0 or later");
    })?;
    tracing::info!(version = %server, "DRI2 version");

    let device_name = find_drm_device_name(drm, DRM_DIR_NAME)?;
    Ok(Dri2Info {
        driver_name: DRIVER_NAME,
        device_name,
        version: info,
    })
}

/// Find the node under `dir` whose device number matches the open `fd`.
pub fn find_drm_device_name(fd: impl AsFd, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let rdev = rustix::fs::fstat(fd)?.st_rdev;
    find_device_node(dir.as_ref(), rdev as u64)
}

/// Probe `dir/card0` .. `dir/card15` for a node with device number `rdev`.
pub fn find_device_node(dir: &Path, rdev: u64) -> Result<PathBuf> {
    for minor in 0..DRM_MAX_MINOR {
        let path = dir.join(format!("card{minor}"));
        if let Ok(stat) = rustix::fs::stat(&path) {
            if stat.st_rdev as u64 == rdev {
                return Ok(path);
            }
        }
    }

    tracing::error!(dir = %dir.display(), rdev, "failed to find the drm device node");
    Err(Error::NotFound(format!(
        "no drm device node under {} for device {rdev:#x}",
        dir.display()
    )))
}
