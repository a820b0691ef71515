//! Shared memory management.
//!
//! This module provides the memory layer that lets the CPU, the GPU and the
//! display controller share surface contents without copies.
//!
//! # Architecture
//!
//! - [`UmpRegistry`]: session-wide handle to the shared memory provider
//! - [`ShmHandle`]: counted reference to one allocation, released on last drop
//! - [`UmpBackend`]: trait for providers; [`MemfdBackend`] is the memfd one
//! - [`SurfaceStorage`]: per-surface record with the CPU access window logic
//! - [`AccessGuard`]: RAII access window
//!
//! # Example
//!
//! ```rust,ignore
//! use mali_accel::memory::{MemfdBackend, MemoryRecord, SurfaceStorage, UmpRegistry};
//!
//! let registry = UmpRegistry::open(MemfdBackend::new());
//! let mut storage = SurfaceStorage::new();
//! // ... attach a MemoryRecord through the accel layer ...
//!
//! let mut window = storage.access()?;
//! window.as_mut_slice().fill(0);
//! // Cache cleaned and memory unmapped when `window` drops
//! ```

mod access;
mod memfd;
mod storage;
mod ump;

pub use access::AccessGuard;
pub use memfd::MemfdBackend;
pub use storage::{MemoryRecord, SurfaceStorage};
pub use ump::{SecureId, ShmHandle, SyncOp, UmpBackend, UmpRegistry, UmpStats};
