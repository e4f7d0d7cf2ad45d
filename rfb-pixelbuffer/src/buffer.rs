//! Pixel buffer access traits.
//!
//! Two traits split read-only from read-write access:
//!
//! - [`PixelBuffer`]: read-only access plus [`get_image`](PixelBuffer::get_image)
//!   extraction into an arbitrary target format
//! - [`MutablePixelBuffer`]: read-write access with rendering operations
//!
//! # Stride Convention
//!
//! All stride values in this API are measured in **pixels**, not bytes.
//! To calculate byte offsets:
//!
//! ```text
//! byte_offset = (y * stride + x) * bytes_per_pixel
//! byte_length = height * stride * bytes_per_pixel
//! ```

use crate::PixelFormat;
use anyhow::{anyhow, Result};
use rfb_common::{Point, Rect};

/// Read-only pixel buffer access.
///
/// Implementations must guarantee that pixel data remains valid and
/// unchanged during read access.
pub trait PixelBuffer {
    /// Returns the dimensions of the pixel buffer as (width, height).
    fn dimensions(&self) -> (u32, u32);

    /// Returns a reference to the pixel format used by this buffer.
    fn pixel_format(&self) -> &PixelFormat;

    /// Gets read-only access to a rectangular region of pixel data.
    ///
    /// `stride` receives the row stride in **pixels** (not bytes). The
    /// returned slice starts at the rectangle's first pixel; use the stride
    /// to navigate rows. Returns `None` if the rectangle is out of bounds.
    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]>;

    /// The buffer's full bounds as a rectangle at the origin.
    fn get_rect(&self) -> Rect {
        let (w, h) = self.dimensions();
        Rect::new(0, 0, w, h)
    }

    /// Extract a rectangle into `dst`, converting to `format`.
    ///
    /// Rows are written at `dst_stride_pixels` (0 = tightly packed at the
    /// rectangle width). Pixel values are converted through the RGB888
    /// domain, so any pair of true-colour formats round-trips losslessly
    /// when both have 8-bit channels.
    ///
    /// # Errors
    ///
    /// Fails if the rectangle is out of bounds or `dst` is too small.
    fn get_image(
        &self,
        format: &PixelFormat,
        dst: &mut [u8],
        rect: Rect,
        dst_stride_pixels: usize,
    ) -> Result<()> {
        let mut src_stride = 0usize;
        let src = self
            .get_buffer(rect, &mut src_stride)
            .ok_or_else(|| anyhow!("get_image: rect {:?} out of bounds", rect))?;

        let src_pf = *self.pixel_format();
        let src_bpp = src_pf.bytes_per_pixel() as usize;
        let dst_bpp = format.bytes_per_pixel() as usize;
        let dst_stride = if dst_stride_pixels == 0 {
            rect.width as usize
        } else {
            dst_stride_pixels
        };

        let needed = (rect.height as usize - 1) * dst_stride * dst_bpp
            + rect.width as usize * dst_bpp;
        if rect.height > 0 && dst.len() < needed {
            return Err(anyhow!(
                "get_image: dst too small: got {} bytes, need {}",
                dst.len(),
                needed
            ));
        }

        // Fast path: identical formats, plain row copies.
        if src_pf == *format {
            for y in 0..rect.height as usize {
                let src_off = y * src_stride * src_bpp;
                let dst_off = y * dst_stride * dst_bpp;
                let row = rect.width as usize * src_bpp;
                dst[dst_off..dst_off + row].copy_from_slice(&src[src_off..src_off + row]);
            }
            return Ok(());
        }

        for y in 0..rect.height as usize {
            for x in 0..rect.width as usize {
                let src_off = (y * src_stride + x) * src_bpp;
                let rgba = src_pf.to_rgb888(&src[src_off..src_off + src_bpp]);
                let out = format.from_rgb888(rgba);
                let dst_off = (y * dst_stride + x) * dst_bpp;
                dst[dst_off..dst_off + dst_bpp].copy_from_slice(&out);
            }
        }
        Ok(())
    }

    /// Convenience wrapper over [`get_image`](Self::get_image): extract a
    /// rectangle as tightly packed canonical-format bytes.
    fn canonical_bytes(&self, rect: Rect) -> Result<Vec<u8>> {
        let canonical = PixelFormat::canonical();
        let mut out =
            vec![0u8; rect.width as usize * rect.height as usize * canonical.bytes_per_pixel() as usize];
        self.get_image(&canonical, &mut out, rect, 0)?;
        Ok(out)
    }
}

/// Mutable pixel buffer with rendering operations.
///
/// For direct pixel manipulation call
/// [`get_buffer_rw()`](Self::get_buffer_rw), modify the data, then
/// [`commit_buffer()`](Self::commit_buffer). For rendering use the
/// high-level [`fill_rect()`](Self::fill_rect),
/// [`copy_rect()`](Self::copy_rect), and [`image_rect()`](Self::image_rect).
pub trait MutablePixelBuffer: PixelBuffer {
    /// Gets read-write access to a rectangular region of pixel data.
    ///
    /// `stride` receives the row stride in **pixels**. After modifying the
    /// data, [`commit_buffer()`](Self::commit_buffer) must be called with
    /// the same rectangle.
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]>;

    /// Commits changes made via [`get_buffer_rw()`](Self::get_buffer_rw).
    fn commit_buffer(&mut self, rect: Rect);

    /// Fills a rectangle with a solid colour.
    ///
    /// `pixel` must match the buffer's pixel format size.
    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()>;

    /// Copies a rectangle within the buffer.
    ///
    /// `src_offset` is the offset from `dest` to the source position.
    /// Overlapping source and destination regions are handled correctly.
    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()>;

    /// Copies image data into a rectangle.
    ///
    /// `stride` is the source stride in **pixels** (0 = tightly packed).
    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()>;
}
