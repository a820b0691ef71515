//! Error types for the driver.

use thiserror::Error;

/// Result type alias using the driver's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer, memory and device operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A surface or its shared memory could not be allocated.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A call to the display device failed.
    #[error("display device error: {0}")]
    Device(String),

    /// Shared memory could not be mapped, synced, or mapped to a null address.
    #[error("mapping failed: {0}")]
    Mapping(String),

    /// The operation targets a surface or allocation lacking required metadata.
    #[error("not found: {0}")]
    NotFound(String),

    /// The virtual resolution is too small for page flipping.
    #[error("insufficient virtual resolution for page flipping: need {needed} lines, have {available}")]
    Geometry {
        /// Lines required (twice the visible height).
        needed: u32,
        /// Lines provided by the device.
        available: u32,
    },

    /// The server offers an interface version the driver cannot use.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A configuration option has a malformed value.
    #[error("invalid value {value:?} for option {name}")]
    InvalidOption {
        /// Option name as written in the configuration.
        name: String,
        /// The rejected value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Wrap a failed device call, naming the operation.
    pub(crate) fn device(op: &str, err: impl std::fmt::Display) -> Self {
        Error::Device(format!("{op} failed: {err}"))
    }
}
