//! Rendering collaborator interface

use super::entity::SourceRect;
use super::types::{Bitmap, Fingerprint, Offset, PixelFormat};

/// Largest bitmap edge the worker will ask a renderer for
pub const MAX_BITMAP_DIMENSION: f64 = 16_384.0;

/// Errors from a [`PageRenderer`]
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("cannot allocate a {width}x{height} bitmap")]
    OutOfMemory { width: u32, height: u32 },

    #[error("page {page} out of range (document has {page_count} pages)")]
    InvalidPage { page: usize, page_count: usize },

    #[error("source region is empty")]
    EmptyRegion,

    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferMismatch { expected: usize, actual: usize },

    #[cfg(feature = "pdf")]
    #[error("PDF engine: {0}")]
    Pdf(#[from] mupdf::error::Error),

    #[error("{detail}")]
    Generic { detail: String },
}

impl RenderError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }

    /// Allocation failures may succeed later or at a smaller scale
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// What to rasterize
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderTarget {
    /// Source page index
    pub page: usize,
    /// Region of the page, `None` for the whole page
    pub region: Option<SourceRect>,
    /// Output pixels per source unit
    pub scale: f64,
    /// Sub-pixel shift in source units
    pub offset: Offset,
    pub format: PixelFormat,
}

impl RenderTarget {
    #[must_use]
    pub fn new(fingerprint: &Fingerprint, format: PixelFormat) -> Self {
        Self {
            page: fingerprint.source.page,
            region: fingerprint.source.rect,
            scale: fingerprint.scale,
            offset: fingerprint.offset,
            format,
        }
    }
}

/// Pixel size of `width` x `height` source units at `scale`.
///
/// Requests beyond [`MAX_BITMAP_DIMENSION`] are refused as allocation
/// failures so the caller can back off.
pub fn checked_output_size(width: f64, height: f64, scale: f64) -> Result<(u32, u32), RenderError> {
    if !(width > 0.0 && height > 0.0 && scale > 0.0) {
        return Err(RenderError::EmptyRegion);
    }
    let out_width = (width * scale).ceil();
    let out_height = (height * scale).ceil();
    if out_width > MAX_BITMAP_DIMENSION || out_height > MAX_BITMAP_DIMENSION {
        return Err(RenderError::OutOfMemory {
            width: out_width.min(f64::from(u32::MAX)) as u32,
            height: out_height.min(f64::from(u32::MAX)) as u32,
        });
    }
    Ok((out_width.max(1.0) as u32, out_height.max(1.0) as u32))
}

/// The PDF rendering engine as seen by the render worker.
///
/// A renderer is created on, and only used from, the thread that drives
/// it, so implementations may hold thread-bound document handles.
pub trait PageRenderer {
    /// Number of pages in the open document
    fn page_count(&self) -> usize;

    /// Rasterize `target`. May take hundreds of milliseconds.
    fn render(&mut self, target: &RenderTarget) -> Result<Bitmap, RenderError>;
}

impl<R: PageRenderer + ?Sized> PageRenderer for Box<R> {
    fn page_count(&self) -> usize {
        (**self).page_count()
    }

    fn render(&mut self, target: &RenderTarget) -> Result<Bitmap, RenderError> {
        (**self).render(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_size_rounds_up() {
        assert_eq!(checked_output_size(100.0, 50.0, 1.5).unwrap(), (150, 75));
        assert_eq!(checked_output_size(10.1, 0.2, 1.0).unwrap(), (11, 1));
    }

    #[test]
    fn oversized_output_is_an_allocation_failure() {
        let err = checked_output_size(1_000.0, 1_000.0, 100.0).unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            err,
            RenderError::OutOfMemory {
                width: 100_000,
                height: 100_000
            }
        ));
    }

    #[test]
    fn logical_failures_are_not_transient() {
        let invalid = RenderError::InvalidPage {
            page: 3,
            page_count: 2,
        };
        assert!(!invalid.is_transient());
        assert!(!RenderError::EmptyRegion.is_transient());
        assert!(!RenderError::generic("broken xref").is_transient());
    }

    #[test]
    fn degenerate_region_is_rejected() {
        assert!(matches!(
            checked_output_size(0.0, 10.0, 1.0),
            Err(RenderError::EmptyRegion)
        ));
        assert!(matches!(
            checked_output_size(10.0, 10.0, f64::NAN),
            Err(RenderError::EmptyRegion)
        ));
    }
}
