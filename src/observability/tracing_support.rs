//! Tracing integration for structured logging and spans.

use crate::dri::Attachment;
use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span for the driver session.
    pub session_spans: bool,
    /// Whether to create spans for buffer creation and destruction.
    pub buffer_spans: bool,
    /// Whether to create spans for present requests.
    pub present_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            session_spans: true,
            buffer_spans: true,
            present_spans: false, // once per frame
        }
    }
}

impl TracingConfig {
    /// Create a config with all spans enabled.
    pub fn all() -> Self {
        Self {
            session_spans: true,
            buffer_spans: true,
            present_spans: true,
        }
    }

    /// Create a minimal config (session span only).
    pub fn minimal() -> Self {
        Self {
            session_spans: true,
            buffer_spans: false,
            present_spans: false,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            session_spans: false,
            buffer_spans: false,
            present_spans: false,
        }
    }
}

/// Create a span for a buffer operation.
///
/// # Example
///
/// ```rust,ignore
/// use mali_accel::observability::span_buffer;
///
/// let span = span_buffer("create", Attachment::BackLeft);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_buffer(op: &'static str, attachment: Attachment) -> Span {
    span!(Level::DEBUG, "buffer", op = op, attachment = ?attachment)
}

/// Create a span for a present request.
#[inline]
pub fn span_present(dst: Attachment, src: Attachment) -> Span {
    span!(Level::TRACE, "present", dst = ?dst, src = ?src)
}

/// Create the span of a driver session.
///
/// The session holds on to it and enters it around every call it serves.
///
/// # Example
///
/// ```rust,ignore
/// use mali_accel::observability::instrument_session;
///
/// let session = instrument_session("/dev/fb0");
/// let _guard = session.enter();
/// ```
pub fn instrument_session(device: &str) -> Span {
    span!(Level::INFO, "session", device = %device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.session_spans);
        assert!(config.buffer_spans);
        assert!(!config.present_spans);
    }

    #[test]
    fn test_tracing_config_presets() {
        assert!(TracingConfig::all().present_spans);
        assert!(!TracingConfig::minimal().buffer_spans);
        let none = TracingConfig::none();
        assert!(!none.session_spans && !none.buffer_spans && !none.present_spans);
    }

    #[test]
    fn test_span_creation() {
        // No subscriber installed; these must not panic.
        let _span = span_buffer("create", Attachment::BackLeft);
        let _span = span_present(Attachment::FrontLeft, Attachment::BackLeft);
        let session = instrument_session("virtual");
        let _guard = session.enter();
    }
}
