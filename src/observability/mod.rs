//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters via `metrics-rs`
//! - **Tracing**: structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `mali_buffers_created` | Counter | Buffers handed out, labelled by `path` |
//! | `mali_buffers_destroyed` | Counter | Buffers destroyed |
//! | `mali_presents` | Counter | Present requests, labelled by `outcome` |
//! | `mali_device_failures` | Counter | Failed device calls, labelled by `op` |
//! | `mali_cache_syncs` | Counter | Cache maintenance, labelled by `op` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use mali_accel::observability::init_metrics;
//!
//! // Call once at startup, then install any metrics exporter.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use self::metrics::{
    BufferPath, ScreenMetrics, init_metrics, record_buffer_created, record_buffer_destroyed,
    record_cache_sync, record_device_failure,
};
pub use self::tracing_support::{TracingConfig, instrument_session, span_buffer, span_present};
