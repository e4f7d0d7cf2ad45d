//! Owned pixel buffer implementation.
//!
//! [`ManagedPixelBuffer`] is the concrete implementation of the
//! [`PixelBuffer`] and [`MutablePixelBuffer`] traits backed by a `Vec<u8>`.
//! It serves as the viewer's framebuffer and as scratch tile storage in the
//! decode path.
//!
//! # Memory Layout
//!
//! Row-major with a stride equal to the width:
//!
//! ```text
//! Total size = W * H * B bytes
//! Pixel at (x, y) starts at offset: (y * W + x) * B
//! ```

use crate::{MutablePixelBuffer, PixelBuffer, PixelFormat};
use anyhow::{anyhow, Result};
use rfb_common::{Point, Rect};

/// A pixel buffer that manages its own memory.
///
/// The stride is always measured in **pixels** and equals the width.
#[derive(Debug, Clone)]
pub struct ManagedPixelBuffer {
    /// Buffer width in pixels
    width: u32,

    /// Buffer height in pixels
    height: u32,

    /// Pixel format describing how pixels are encoded
    format: PixelFormat,

    /// Raw pixel data (row-major, no padding)
    data: Vec<u8>,

    /// Stride in **pixels** (always equals width for this implementation)
    stride: usize,
}

impl ManagedPixelBuffer {
    /// Creates a new pixel buffer with the specified dimensions and format,
    /// initialised to zero.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize;
        let bytes_per_pixel = format.bytes_per_pixel() as usize;
        let data = vec![0u8; stride * height as usize * bytes_per_pixel];

        Self {
            width,
            height,
            format,
            data,
            stride,
        }
    }

    /// Resizes the buffer to new dimensions.
    ///
    /// Reallocates the internal buffer; existing pixel data is not preserved.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.stride = width as usize;
        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        self.data
            .resize(self.stride * height as usize * bytes_per_pixel, 0);
    }

    /// Returns the stride in pixels (always equals the width).
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns a reference to the raw pixel data (row-major, no padding).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the buffer width in pixels.
    pub fn width(&self) -> usize {
        self.width as usize
    }

    /// Returns the buffer height in pixels.
    pub fn height(&self) -> usize {
        self.height as usize
    }

    /// Returns a reference to the pixel format.
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    fn validate_rect(&self, rect: Rect) -> Result<()> {
        if rect.x < 0
            || rect.y < 0
            || rect.x as u32 + rect.width > self.width
            || rect.y as u32 + rect.height > self.height
        {
            return Err(anyhow!(
                "Rectangle out of bounds: {:?} (buffer size: {}x{})",
                rect,
                self.width,
                self.height
            ));
        }
        Ok(())
    }

    fn byte_offset(&self, x: usize, y: usize) -> usize {
        (y * self.stride + x) * self.format.bytes_per_pixel() as usize
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixel_format(&self) -> &PixelFormat {
        &self.format
    }

    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]> {
        if self.validate_rect(rect).is_err() {
            return None;
        }

        *stride = self.stride;
        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        let start = self.byte_offset(rect.x as usize, rect.y as usize);
        let len = rect.height as usize * self.stride * bytes_per_pixel;
        // Last row only extends to the rect's right edge, not the full stride.
        let len = len - (self.stride - rect.width as usize) * bytes_per_pixel;

        Some(&self.data[start..start + len])
    }
}

impl MutablePixelBuffer for ManagedPixelBuffer {
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]> {
        if self.validate_rect(rect).is_err() {
            return None;
        }

        *stride = self.stride;
        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        let start = self.byte_offset(rect.x as usize, rect.y as usize);
        let len = rect.height as usize * self.stride * bytes_per_pixel
            - (self.stride - rect.width as usize) * bytes_per_pixel;

        Some(&mut self.data[start..start + len])
    }

    fn commit_buffer(&mut self, _rect: Rect) {
        // Direct modification of the backing store; nothing to flush.
    }

    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()> {
        self.validate_rect(rect)?;

        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        if pixel.len() != bytes_per_pixel {
            return Err(anyhow!(
                "Invalid pixel size: got {} bytes, expected {}",
                pixel.len(),
                bytes_per_pixel
            ));
        }

        for y in 0..rect.height as usize {
            let row_offset = self.byte_offset(rect.x as usize, rect.y as usize + y);
            for x in 0..rect.width as usize {
                let offset = row_offset + x * bytes_per_pixel;
                self.data[offset..offset + bytes_per_pixel].copy_from_slice(pixel);
            }
        }

        Ok(())
    }

    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()> {
        self.validate_rect(dest)?;

        // src_offset is the offset FROM destination TO source.
        let src_rect = dest.translated(src_offset.x, src_offset.y);
        self.validate_rect(src_rect)?;

        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        let rect_width_bytes = dest.width as usize * bytes_per_pixel;

        // If source is above/left of dest, copy bottom-up so overlapping
        // source rows are not clobbered before they are read.
        let rows: Box<dyn Iterator<Item = usize>> = if src_offset.y < 0
            || (src_offset.y == 0 && src_offset.x < 0)
        {
            Box::new((0..dest.height as usize).rev())
        } else {
            Box::new(0..dest.height as usize)
        };

        for y in rows {
            let src = self.byte_offset(src_rect.x as usize, src_rect.y as usize + y);
            let dst = self.byte_offset(dest.x as usize, dest.y as usize + y);
            self.data.copy_within(src..src + rect_width_bytes, dst);
        }

        Ok(())
    }

    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()> {
        self.validate_rect(dest)?;
        if dest.is_empty() {
            return Ok(());
        }

        let bytes_per_pixel = self.format.bytes_per_pixel() as usize;
        let rect_width_bytes = dest.width as usize * bytes_per_pixel;

        // stride == 0 means the source is tightly packed.
        let src_stride = if stride == 0 {
            dest.width as usize
        } else {
            stride
        };
        let src_stride_bytes = src_stride * bytes_per_pixel;

        let required_src_bytes =
            src_stride_bytes * (dest.height as usize - 1) + rect_width_bytes;
        if pixels.len() < required_src_bytes {
            return Err(anyhow!(
                "Insufficient source data: got {} bytes, need at least {}",
                pixels.len(),
                required_src_bytes
            ));
        }

        for y in 0..dest.height as usize {
            let dst_offset = self.byte_offset(dest.x as usize, dest.y as usize + y);
            let src_offset = y * src_stride_bytes;
            self.data[dst_offset..dst_offset + rect_width_bytes]
                .copy_from_slice(&pixels[src_offset..src_offset + rect_width_bytes]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_buffer() {
        let buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        assert_eq!(buffer.dimensions(), (100, 100));
        assert_eq!(buffer.stride(), 100);
        assert_eq!(buffer.data().len(), 100 * 100 * 4);
    }

    #[test]
    fn test_resize() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        buffer.resize(200, 150);
        assert_eq!(buffer.dimensions(), (200, 150));
        assert_eq!(buffer.stride(), 200);
        assert_eq!(buffer.data().len(), 200 * 150 * 4);
    }

    #[test]
    fn test_fill_rect() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let format = *buffer.pixel_format();
        let red = format.from_rgb888([255, 0, 0, 255]);

        buffer.fill_rect(Rect::new(10, 10, 20, 20), &red).unwrap();

        let mut stride = 0;
        let pixels = buffer
            .get_buffer(Rect::new(15, 15, 1, 1), &mut stride)
            .expect("get_buffer");
        assert_eq!(&pixels[0..4], &red[..]);
    }

    #[test]
    fn test_copy_rect_non_overlapping() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let format = *buffer.pixel_format();

        let red = format.from_rgb888([255, 0, 0, 255]);
        buffer.fill_rect(Rect::new(10, 10, 20, 20), &red).unwrap();

        // Source at (10, 10), destination at (50, 50):
        // src_offset = source - dest = (-40, -40)
        buffer
            .copy_rect(Rect::new(50, 50, 20, 20), Point::new(-40, -40))
            .unwrap();

        let mut stride = 0;
        let pixels = buffer
            .get_buffer(Rect::new(55, 55, 1, 1), &mut stride)
            .expect("get_buffer");
        assert_eq!(&pixels[0..4], &red[..]);
    }

    #[test]
    fn test_copy_rect_overlapping_down() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let format = *buffer.pixel_format();

        let blue = format.from_rgb888([0, 0, 255, 255]);
        buffer.fill_rect(Rect::new(20, 20, 30, 30), &blue).unwrap();

        // Shift the block down by 10 pixels (overlapping copy).
        buffer
            .copy_rect(Rect::new(20, 30, 30, 30), Point::new(0, -10))
            .unwrap();

        let mut stride = 0;
        let pixels = buffer
            .get_buffer(Rect::new(25, 55, 1, 1), &mut stride)
            .expect("get_buffer");
        assert_eq!(&pixels[0..4], &blue[..]);
    }

    #[test]
    fn test_image_rect_tightly_packed() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let format = *buffer.pixel_format();

        let green = format.from_rgb888([0, 255, 0, 255]);
        let mut image_data = Vec::new();
        for _ in 0..100 {
            image_data.extend_from_slice(&green);
        }

        buffer
            .image_rect(Rect::new(30, 30, 10, 10), &image_data, 0)
            .unwrap();

        let mut stride = 0;
        let pixels = buffer
            .get_buffer(Rect::new(35, 35, 1, 1), &mut stride)
            .expect("get_buffer");
        assert_eq!(&pixels[0..4], &green[..]);
    }

    #[test]
    fn test_image_rect_with_stride() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let format = *buffer.pixel_format();

        // 10x10 image with a source stride of 20 pixels.
        let yellow = format.from_rgb888([255, 255, 0, 255]);
        let mut image_data = Vec::new();
        for _ in 0..10 {
            for _ in 0..10 {
                image_data.extend_from_slice(&yellow);
            }
            for _ in 0..10 {
                image_data.extend_from_slice(&[0, 0, 0, 0]);
            }
        }

        buffer
            .image_rect(Rect::new(40, 40, 10, 10), &image_data, 20)
            .unwrap();

        let mut stride = 0;
        let pixels = buffer
            .get_buffer(Rect::new(45, 45, 1, 1), &mut stride)
            .expect("get_buffer");
        assert_eq!(&pixels[0..4], &yellow[..]);
    }

    #[test]
    fn test_validate_rect_out_of_bounds() {
        let buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());

        let mut stride = 0;
        // Too wide
        assert!(buffer
            .get_buffer(Rect::new(90, 50, 20, 10), &mut stride)
            .is_none());
        // Too tall
        assert!(buffer
            .get_buffer(Rect::new(50, 90, 10, 20), &mut stride)
            .is_none());
        // Negative origin
        assert!(buffer
            .get_buffer(Rect::new(-1, 0, 10, 10), &mut stride)
            .is_none());
        // Valid rectangle
        assert!(buffer
            .get_buffer(Rect::new(50, 50, 40, 40), &mut stride)
            .is_some());
    }

    #[test]
    fn test_get_buffer_stride_is_width() {
        let buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let mut stride = 0;
        let slice = buffer.get_buffer(Rect::new(10, 10, 50, 50), &mut stride);
        assert!(slice.is_some());
        assert_eq!(stride, 100);
    }

    #[test]
    fn test_get_buffer_rw() {
        let mut buffer = ManagedPixelBuffer::new(100, 100, PixelFormat::rgb888());
        let rect = Rect::new(10, 10, 50, 50);
        let mut stride = 0;

        let slice = buffer.get_buffer_rw(rect, &mut stride);
        assert!(slice.is_some());
        assert_eq!(stride, 100);

        buffer.commit_buffer(rect);
    }
}
