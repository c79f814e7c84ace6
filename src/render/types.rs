//! Core value types shared by the cache, queue and worker

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::entity::{Entity, SourceRect};
use super::renderer::RenderError;

/// Tolerance when comparing fingerprint coordinates and scales
pub const FINGERPRINT_EPSILON: f64 = 1e-6;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= FINGERPRINT_EPSILON
}

/// Sub-pixel offset of a render, in source units
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

impl Offset {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Entity-derived part of a fingerprint
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceSpec {
    /// Source page index
    pub page: usize,
    /// Region of the page, or `None` for the full page
    pub rect: Option<SourceRect>,
}

impl SourceSpec {
    /// Equal page and region within [`FINGERPRINT_EPSILON`]
    #[must_use]
    pub fn same_as(&self, other: &SourceSpec) -> bool {
        if self.page != other.page {
            return false;
        }
        match (self.rect, other.rect) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                close(a.x, b.x)
                    && close(a.y, b.y)
                    && close(a.width, b.width)
                    && close(a.height, b.height)
            }
            _ => false,
        }
    }
}

/// Parameters a render was (or will be) produced with
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fingerprint {
    pub source: SourceSpec,
    pub scale: f64,
    pub offset: Offset,
}

impl Fingerprint {
    /// Snapshot the entity's live source fields together with a view
    #[must_use]
    pub fn capture(entity: &Entity, scale: f64, offset: Offset) -> Self {
        Self {
            source: entity.source(),
            scale,
            offset,
        }
    }

    /// Same scale and sub-pixel offset
    #[must_use]
    pub fn same_view(&self, other: &Fingerprint) -> bool {
        close(self.scale, other.scale)
            && close(self.offset.x, other.offset.x)
            && close(self.offset.y, other.offset.y)
    }

    /// Same source and same view
    #[must_use]
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.source.same_as(&other.source) && self.same_view(other)
    }
}

/// Pixel layout of a [`Bitmap`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 3 bytes per pixel, opaque
    Rgb,
    /// 4 bytes per pixel, premultiplied alpha
    Rgba,
}

impl PixelFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// Owned device-independent pixel buffer
#[derive(Clone)]
pub struct Bitmap {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Wrap an existing buffer, checking that it is large enough
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        stride: usize,
        pixels: Vec<u8>,
    ) -> Result<Self, RenderError> {
        let row_bytes = width as usize * format.bytes_per_pixel();
        let expected = stride.saturating_mul(height as usize);
        if stride < row_bytes || pixels.len() < expected {
            return Err(RenderError::BufferMismatch {
                expected: expected.max(row_bytes * height as usize),
                actual: pixels.len(),
            });
        }
        Ok(Self {
            format,
            width,
            height,
            stride,
            pixels,
        })
    }

    /// Allocate a zeroed, tightly packed bitmap.
    ///
    /// Allocation failure is reported as [`RenderError::OutOfMemory`]
    /// instead of aborting the process.
    pub fn blank(format: PixelFormat, width: u32, height: u32) -> Result<Self, RenderError> {
        let oom = || RenderError::OutOfMemory { width, height };
        let stride = (width as usize)
            .checked_mul(format.bytes_per_pixel())
            .ok_or_else(oom)?;
        let len = stride.checked_mul(height as usize).ok_or_else(oom)?;

        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|_| oom())?;
        pixels.resize(len, 0);

        Ok(Self {
            format,
            width,
            height,
            stride,
            pixels,
        })
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes between the starts of consecutive rows
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Pixel bytes of row `y`, without stride padding
    #[must_use]
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let len = self.width as usize * self.format.bytes_per_pixel();
        self.pixels.get(start..start + len)
    }

    /// Copy of the pixels with stride padding removed
    #[must_use]
    pub fn to_packed(&self) -> Vec<u8> {
        let row_bytes = self.width as usize * self.format.bytes_per_pixel();
        if row_bytes == self.stride {
            return self.pixels[..row_bytes * self.height as usize].to_vec();
        }
        let mut out = Vec::with_capacity(row_bytes * self.height as usize);
        for y in 0..self.height {
            if let Some(row) = self.row(y) {
                out.extend_from_slice(row);
            }
        }
        out
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// A rendered bitmap together with the fingerprint it was rendered for
#[derive(Debug)]
pub struct CacheEntry {
    bitmap: Bitmap,
    fingerprint: Fingerprint,
    uploaded: AtomicBool,
}

impl CacheEntry {
    #[must_use]
    pub fn new(bitmap: Bitmap, fingerprint: Fingerprint) -> Self {
        Self {
            bitmap,
            fingerprint,
            uploaded: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Whether the bitmap has been transferred to a display surface
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    /// Flag the bitmap as uploaded; returns `true` for the first caller only
    pub fn mark_uploaded(&self) -> bool {
        !self.uploaded.swap(true, Ordering::AcqRel)
    }
}

/// Outstanding render work for one entity
#[derive(Clone, Debug)]
pub struct PendingJob {
    pub entity: Entity,
    pub fingerprint: Fingerprint,
}

/// Answer to a render query
#[derive(Clone, Debug)]
pub enum Lookup {
    /// Cached bitmap matches the request exactly
    Exact(Arc<CacheEntry>),
    /// Cached bitmap depicts the entity at another scale or offset; a render
    /// for the requested view has been queued
    Preview(Arc<CacheEntry>),
    /// Nothing usable yet; a render has been queued
    Pending,
}

impl Lookup {
    /// The usable cache entry, exact or preview
    #[must_use]
    pub fn entry(&self) -> Option<&Arc<CacheEntry>> {
        match self {
            Self::Exact(entry) | Self::Preview(entry) => Some(entry),
            Self::Pending => None,
        }
    }

    #[must_use]
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(x: f64) -> SourceSpec {
        SourceSpec {
            page: 0,
            rect: Some(SourceRect::new(x, 0.0, 10.0, 10.0)),
        }
    }

    #[test]
    fn source_comparison_tolerates_rounding_noise() {
        assert!(spec(1.0).same_as(&spec(1.0 + 1e-9)));
        assert!(!spec(1.0).same_as(&spec(1.5)));

        let page = SourceSpec { page: 0, rect: None };
        assert!(!page.same_as(&spec(0.0)));
    }

    #[test]
    fn view_mismatch_keeps_source_match() {
        let a = Fingerprint {
            source: spec(0.0),
            scale: 1.0,
            offset: Offset::default(),
        };
        let b = Fingerprint { scale: 2.0, ..a };

        assert!(a.source.same_as(&b.source));
        assert!(!a.same_view(&b));
        assert!(!a.matches(&b));
        assert!(a.matches(&a));
    }

    #[test]
    fn bitmap_rejects_short_buffer() {
        let err = Bitmap::new(PixelFormat::Rgb, 4, 4, 12, vec![0; 40]).unwrap_err();
        assert!(matches!(
            err,
            RenderError::BufferMismatch {
                expected: 48,
                actual: 40
            }
        ));
    }

    #[test]
    fn packed_copy_drops_stride_padding() {
        let pixels = vec![1, 1, 1, 9, 2, 2, 2, 9];
        let bitmap = Bitmap::new(PixelFormat::Rgb, 1, 2, 4, pixels).unwrap();
        assert_eq!(bitmap.row(1), Some(&[2, 2, 2][..]));
        assert_eq!(bitmap.to_packed(), vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn blank_reports_oversized_allocation() {
        let err = Bitmap::blank(PixelFormat::Rgba, u32::MAX, u32::MAX).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn upload_flag_is_set_once() {
        let bitmap = Bitmap::blank(PixelFormat::Rgb, 1, 1).unwrap();
        let entry = CacheEntry::new(
            bitmap,
            Fingerprint {
                source: spec(0.0),
                scale: 1.0,
                offset: Offset::default(),
            },
        );
        assert!(!entry.is_uploaded());
        assert!(entry.mark_uploaded());
        assert!(!entry.mark_uploaded());
        assert!(entry.is_uploaded());
    }
}
