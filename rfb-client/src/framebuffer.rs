//! Viewer framebuffer state.
//!
//! The local framebuffer always uses the canonical pixel format; decoders
//! convert from the session's wire format on the way in, which keeps cache
//! snapshots and content hashing stride- and format-trivial.

use anyhow::Result;
use rfb_common::Rect;
use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelBuffer, PixelFormat};

/// The client's framebuffer plus the session's wire pixel format.
pub struct Framebuffer {
    /// Local pixels, canonical format, stride = width.
    buffer: ManagedPixelBuffer,
    /// The wire format rect payloads arrive in.
    server_pixel_format: PixelFormat,
}

impl Framebuffer {
    /// Create a framebuffer of the given size for a session using
    /// `server_pixel_format` on the wire.
    pub fn new(width: u32, height: u32, server_pixel_format: PixelFormat) -> Self {
        Self {
            buffer: ManagedPixelBuffer::new(width, height, PixelFormat::canonical()),
            server_pixel_format,
        }
    }

    /// The session's wire pixel format.
    pub fn server_pixel_format(&self) -> &PixelFormat {
        &self.server_pixel_format
    }

    /// Framebuffer dimensions in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        self.buffer.dimensions()
    }

    /// Whole-framebuffer bounds.
    pub fn bounds(&self) -> Rect {
        self.buffer.get_rect()
    }

    /// Resize on a desktop-size change; contents are not preserved.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.buffer.resize(width, height);
    }

    /// Blit a tightly packed canonical tile at `rect`.
    pub fn blit_canonical(&mut self, rect: Rect, pixels: &[u8]) -> Result<()> {
        self.buffer.image_rect(rect, pixels, 0)
    }

    /// Snapshot a rectangle as tightly packed canonical bytes (the seed
    /// path reads back what was just drawn).
    pub fn snapshot(&self, rect: Rect) -> Result<Vec<u8>> {
        self.buffer.canonical_bytes(rect)
    }

    /// Read-only access to the backing buffer.
    pub fn pixels(&self) -> &ManagedPixelBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_then_snapshot_round_trips() {
        let mut fb = Framebuffer::new(32, 32, PixelFormat::canonical());
        let tile = vec![0x42u8; 8 * 8 * 4];
        fb.blit_canonical(Rect::new(4, 4, 8, 8), &tile).unwrap();
        let snap = fb.snapshot(Rect::new(4, 4, 8, 8)).unwrap();
        assert_eq!(snap, tile);
    }

    #[test]
    fn test_snapshot_out_of_bounds_fails() {
        let fb = Framebuffer::new(16, 16, PixelFormat::canonical());
        assert!(fb.snapshot(Rect::new(8, 8, 16, 16)).is_err());
    }

    #[test]
    fn test_buffer_is_canonical_regardless_of_wire_format() {
        let mut wire = PixelFormat::canonical();
        wire.big_endian = true;
        let fb = Framebuffer::new(8, 8, wire);
        assert!(fb.pixels().pixel_format().is_canonical());
        assert!(fb.server_pixel_format().big_endian);
    }
}
