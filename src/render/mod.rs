//! Render cache and background rendering pipeline.
//!
//! The UI asks [`RenderService::get_rendered_or_queue`] for a bitmap of a
//! page or a box. Hits come back at once; misses are queued for the render
//! worker, which publishes finished bitmaps into the shared [`Cache`] and
//! announces them through [`RenderService::poll_events`].

use std::time::Duration;

mod entity;
mod lru;
#[cfg(feature = "pdf")]
mod engine;
mod queue;
mod renderer;
mod service;
mod types;
mod worker;

pub use entity::{
    BoxGeometry, BoxHandle, Entity, MIN_DEST_SCALE, PageEntity, Placement, SourceRect,
};
pub use lru::{Cache, Insertion, Iter};
#[cfg(feature = "pdf")]
pub use engine::MupdfRenderer;
pub use queue::{Enqueued, QueueOrder, RequestQueue};
pub use renderer::{
    MAX_BITMAP_DIMENSION, PageRenderer, RenderError, RenderTarget, checked_output_size,
};
pub use service::{ListenerId, RenderConfig, RenderService, RenderStats, WorkerMode};
pub use types::{
    Bitmap, CacheEntry, FINGERPRINT_EPSILON, Fingerprint, Lookup, Offset, PendingJob, PixelFormat,
    SourceSpec,
};
pub use worker::WorkerState;

/// Bitmaps kept in memory at once
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// How long shutdown waits for a render in progress
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);
