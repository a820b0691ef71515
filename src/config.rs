//! Driver configuration.
//!
//! Options arrive from the server configuration as name/value strings, in the
//! same shape as a `Device` section:
//!
//! ```text
//! Option "DRI2"            "true"
//! Option "DRI2_PAGE_FLIP"  "true"
//! Option "DRI2_WAIT_VSYNC" "true"
//! Option "UMP_CACHED"      "false"
//! ```
//!
//! ```rust,ignore
//! use mali_accel::config::DriverConfig;
//!
//! let config = DriverConfig::from_options([("DRI2_PAGE_FLIP", "on")])?;
//! assert!(config.page_flipping);
//! ```

use crate::error::{Error, Result};

/// Default pitch alignment in bytes for offscreen surfaces.
pub const DEFAULT_PITCH_ALIGN: u32 = 8;

/// Configuration for a driver session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Register the buffer-management extension at all.
    pub dri2: bool,
    /// Hand out flip-capable buffers for windows when the device allows it.
    pub page_flipping: bool,
    /// Block each flip until the next vertical blank.
    pub flip_vsync: bool,
    /// Allocate shared memory with CPU caching enabled.
    pub ump_cached: bool,
    /// Pitch alignment for offscreen surfaces (power of two).
    pub pitch_align: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dri2: true,
            page_flipping: false,
            flip_vsync: false,
            ump_cached: true,
            pitch_align: DEFAULT_PITCH_ALIGN,
        }
    }
}

impl DriverConfig {
    /// Create a config with page flipping and vsync enabled.
    pub fn flipping() -> Self {
        Self {
            page_flipping: true,
            flip_vsync: true,
            ..Self::default()
        }
    }

    /// Enable or disable page flipping.
    pub fn with_page_flipping(mut self, enabled: bool) -> Self {
        self.page_flipping = enabled;
        self
    }

    /// Enable or disable waiting for vblank after each flip.
    pub fn with_flip_vsync(mut self, enabled: bool) -> Self {
        self.flip_vsync = enabled;
        self
    }

    /// Enable or disable cached shared memory.
    pub fn with_ump_cached(mut self, enabled: bool) -> Self {
        self.ump_cached = enabled;
        self
    }

    /// Set the pitch alignment. Values that are not a power of two are rounded up.
    pub fn with_pitch_align(mut self, align: u32) -> Self {
        self.pitch_align = align.max(1).next_power_of_two();
        self
    }

    /// Build a config from server option pairs.
    ///
    /// Option names are case-insensitive and ignore `_`, matching how the
    /// server compares option names. Unknown options are logged and skipped.
    pub fn from_options<'a, I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();

        for (name, value) in options {
            match normalize(name).as_str() {
                "dri2" => config.dri2 = parse_bool(name, value)?,
                "dri2pageflip" => config.page_flipping = parse_bool(name, value)?,
                "dri2waitvsync" => config.flip_vsync = parse_bool(name, value)?,
                "umpcached" => config.ump_cached = parse_bool(name, value)?,
                "pitchalign" => {
                    let align: u32 = value.trim().parse().map_err(|_| invalid(name, value))?;
                    if align == 0 || !align.is_power_of_two() {
                        return Err(invalid(name, value));
                    }
                    config.pitch_align = align;
                }
                _ => tracing::warn!(option = %name, "ignoring unknown driver option"),
            }
        }

        if config.flip_vsync && !config.page_flipping {
            tracing::debug!("DRI2_WAIT_VSYNC has no effect without DRI2_PAGE_FLIP");
        }

        Ok(config)
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidOption {
        name: name.to_string(),
        value: value.to_string(),
    }
}
