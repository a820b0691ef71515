//! Metrics collection using metrics-rs.

use crate::memory::SyncOp;
use metrics::{Counter, Unit, counter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BUFFERS_CREATED: &str = "mali_buffers_created";
const BUFFERS_DESTROYED: &str = "mali_buffers_destroyed";
const PRESENTS: &str = "mali_presents";
const DEVICE_FAILURES: &str = "mali_device_failures";
const CACHE_SYNCS: &str = "mali_cache_syncs";

/// How a buffer's backing surface was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPath {
    /// Window into the double-height framebuffer.
    Flip,
    /// The drawable's own surface.
    Front,
    /// A freshly allocated offscreen surface.
    Offscreen,
}

impl BufferPath {
    /// Label value used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferPath::Flip => "flip",
            BufferPath::Front => "front",
            BufferPath::Offscreen => "offscreen",
        }
    }
}

/// Initialize metrics descriptions.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_CREATED,
        Unit::Count,
        "Render buffers handed out, by path"
    );
    metrics::describe_counter!(BUFFERS_DESTROYED, Unit::Count, "Render buffers destroyed");
    metrics::describe_counter!(
        PRESENTS,
        Unit::Count,
        "Present requests, by outcome (flipped, copied, skipped)"
    );
    metrics::describe_counter!(
        DEVICE_FAILURES,
        Unit::Count,
        "Failed framebuffer device calls, by operation"
    );
    metrics::describe_counter!(
        CACHE_SYNCS,
        Unit::Count,
        "CPU cache maintenance operations, by kind"
    );
}

/// Record a buffer handed out.
#[inline]
pub fn record_buffer_created(path: BufferPath) {
    counter!(BUFFERS_CREATED, "path" => path.as_str()).increment(1);
}

/// Record a buffer destroyed.
#[inline]
pub fn record_buffer_destroyed() {
    counter!(BUFFERS_DESTROYED).increment(1);
}

/// Record a failed device call.
#[inline]
pub fn record_device_failure(op: &'static str) {
    counter!(DEVICE_FAILURES, "op" => op).increment(1);
}

/// Record a cache maintenance operation.
#[inline]
pub fn record_cache_sync(op: SyncOp) {
    counter!(CACHE_SYNCS, "op" => op.as_str()).increment(1);
}

/// Pre-registered counters for one screen.
#[derive(Clone)]
pub struct ScreenMetrics {
    screen: String,
    flips: Counter,
    copies: Counter,
    skipped: Counter,
}

impl ScreenMetrics {
    /// Create the counters for a screen.
    pub fn new(screen: &str) -> Self {
        Self {
            screen: screen.to_string(),
            flips: counter!(PRESENTS, "screen" => screen.to_string(), "outcome" => "flipped"),
            copies: counter!(PRESENTS, "screen" => screen.to_string(), "outcome" => "copied"),
            skipped: counter!(PRESENTS, "screen" => screen.to_string(), "outcome" => "skipped"),
        }
    }

    /// Record a page flip.
    #[inline]
    pub fn record_flip(&self) {
        self.flips.increment(1);
    }

    /// Record a region copy.
    #[inline]
    pub fn record_copy(&self) {
        self.copies.increment(1);
    }

    /// Record a skipped present.
    #[inline]
    pub fn record_skip(&self) {
        self.skipped.increment(1);
    }

    /// The screen name.
    pub fn screen(&self) -> &str {
        &self.screen
    }
}
