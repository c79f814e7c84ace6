//! MuPDF-backed [`PageRenderer`]

use std::path::Path;

use mupdf::{Colorspace, Device, Document, Matrix, Pixmap};

use super::entity::SourceRect;
use super::renderer::{PageRenderer, RenderError, RenderTarget, checked_output_size};
use super::types::{Bitmap, PixelFormat};

/// Renders pages and page regions of one PDF document.
///
/// Holds a MuPDF document handle, so it must stay on the thread that
/// opened it. Open it inside the factory passed to
/// [`super::RenderService::new`].
pub struct MupdfRenderer {
    doc: Document,
    page_count: usize,
}

impl MupdfRenderer {
    pub fn open(path: &Path) -> Result<Self, RenderError> {
        let doc = Document::open(path.to_string_lossy().as_ref())?;
        let page_count = usize::try_from(doc.page_count()?).unwrap_or(0);
        Ok(Self { doc, page_count })
    }

    fn check_page(&self, page: usize) -> Result<(), RenderError> {
        if page >= self.page_count {
            return Err(RenderError::InvalidPage {
                page,
                page_count: self.page_count,
            });
        }
        Ok(())
    }
}

impl PageRenderer for MupdfRenderer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&mut self, target: &RenderTarget) -> Result<Bitmap, RenderError> {
        self.check_page(target.page)?;
        let page = self.doc.load_page(target.page as i32)?;
        let bounds = page.bounds()?;
        let page_rect = SourceRect::new(
            f64::from(bounds.x0),
            f64::from(bounds.y0),
            f64::from(bounds.x1 - bounds.x0),
            f64::from(bounds.y1 - bounds.y0),
        );
        let (region, width, height) = output_window(target, page_rect)?;
        let (shift_x, shift_y) = device_shift(target, region);

        let mut matrix = Matrix::new_scale(target.scale as f32, target.scale as f32);
        matrix.concat(Matrix::new_translate(shift_x as f32, shift_y as f32));

        // Only the region is rasterized: its origin lands on pixel (0, 0)
        let alpha = target.format == PixelFormat::Rgba;
        let mut pixmap = Pixmap::new_with_w_h(
            &Colorspace::device_rgb(),
            width as i32,
            height as i32,
            alpha,
        )?;
        if alpha {
            pixmap.clear()?;
        } else {
            pixmap.clear_with(0xff)?;
        }
        {
            let device = Device::from_pixmap(&pixmap)?;
            page.run(&device, &matrix)?;
        }

        copy_pixmap(&pixmap, target.format, width, height)
    }
}

/// Source rectangle to rasterize and its output size in pixels
fn output_window(
    target: &RenderTarget,
    page_rect: SourceRect,
) -> Result<(SourceRect, u32, u32), RenderError> {
    let region = target.region.unwrap_or(page_rect);
    let (width, height) = checked_output_size(region.width, region.height, target.scale)?;
    Ok((region, width, height))
}

/// Device-space translation that puts the region origin at pixel (0, 0),
/// moved by the sub-pixel offset
fn device_shift(target: &RenderTarget, region: SourceRect) -> (f64, f64) {
    (
        (target.offset.x - region.x) * target.scale,
        (target.offset.y - region.y) * target.scale,
    )
}

fn copy_pixmap(
    pixmap: &Pixmap,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Bitmap, RenderError> {
    copy_samples(
        pixmap.samples(),
        pixmap.stride() as usize,
        pixmap.n() as usize,
        format,
        width,
        height,
    )
}

/// Repack `n`-channel samples laid out `stride` bytes per row into a
/// tightly packed bitmap of `format`
fn copy_samples(
    samples: &[u8],
    stride: usize,
    n: usize,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Bitmap, RenderError> {
    let out_bpp = format.bytes_per_pixel();
    if n < out_bpp || n < 3 {
        return Err(RenderError::generic(format!(
            "Unsupported pixmap format: {n} channels"
        )));
    }

    let row_len = width as usize * n;
    let expected = stride.saturating_mul(height as usize);
    if stride < row_len || samples.len() < expected {
        return Err(RenderError::BufferMismatch {
            expected: expected.max(row_len.saturating_mul(height as usize)),
            actual: samples.len(),
        });
    }

    let mut bitmap = Bitmap::blank(format, width, height)?;
    let out_stride = bitmap.stride();
    let pixels = bitmap.pixels_mut();
    for (row, out_row) in samples
        .chunks(stride)
        .zip(pixels.chunks_exact_mut(out_stride))
    {
        for (src, dst) in row[..row_len]
            .chunks_exact(n)
            .zip(out_row.chunks_exact_mut(out_bpp))
        {
            dst.copy_from_slice(&src[..out_bpp]);
        }
    }

    Ok(bitmap)
}
