//! Raw encoding - uncompressed pixel data.
//!
//! Raw encoding (type 0) transmits pixels as uncompressed data in the
//! session's wire pixel format, row-major and tightly packed:
//!
//! ```text
//! +-------------+
//! | Pixel data  |  width * height * bytes_per_pixel bytes
//! +-------------+
//! ```
//!
//! It is the least bandwidth-efficient encoding but the cheapest to decode,
//! and the one the cache protocol tests and fallback paths rely on. Raw is
//! lossless by construction.

use crate::{convert_pixels, Decoder, Encoder, MutablePixelBuffer, PixelBuffer, PixelFormat};
use crate::{Rectangle, RfbInStream, ENCODING_RAW};
use anyhow::{Context, Result};
use bytes::Bytes;
use rfb_common::Rect;
use tokio::io::AsyncRead;

/// Decoder for raw (uncompressed) pixel data.
pub struct RawDecoder;

impl RawDecoder {
    fn payload_len(rect: &Rectangle, pf: &PixelFormat) -> usize {
        rect.width as usize * rect.height as usize * pf.bytes_per_pixel() as usize
    }
}

impl Decoder for RawDecoder {
    fn encoding_type(&self) -> i32 {
        ENCODING_RAW
    }

    fn is_lossless(&self) -> bool {
        true
    }

    async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        pf: &PixelFormat,
    ) -> Result<Bytes> {
        let len = Self::payload_len(rect, pf);
        let mut payload = vec![0u8; len];
        stream
            .read_bytes(&mut payload)
            .await
            .with_context(|| format!("raw payload, {len} bytes"))?;
        Ok(Bytes::from(payload))
    }

    fn decode(
        &self,
        payload: &[u8],
        rect: &Rectangle,
        pf: &PixelFormat,
        tile: &mut dyn MutablePixelBuffer,
    ) -> Result<()> {
        let expected = Self::payload_len(rect, pf);
        if payload.len() != expected {
            anyhow::bail!(
                "raw payload is {} bytes, expected {} for {}x{}",
                payload.len(),
                expected,
                rect.width,
                rect.height
            );
        }
        let count = rect.width as usize * rect.height as usize;
        let converted = convert_pixels(payload, pf, tile.pixel_format(), count)?;
        tile.image_rect(
            Rect::new(0, 0, rect.width as u32, rect.height as u32),
            &converted,
            0,
        )
        .context("blit raw tile")
    }
}

/// Encoder producing raw payloads.
pub struct RawEncoder;

impl Encoder for RawEncoder {
    fn encoding_type(&self) -> i32 {
        ENCODING_RAW
    }

    fn is_lossless(&self) -> bool {
        true
    }

    fn encode(&self, pb: &dyn PixelBuffer, rect: Rect, pf: &PixelFormat) -> Result<Bytes> {
        let mut payload =
            vec![0u8; rect.width as usize * rect.height as usize * pf.bytes_per_pixel() as usize];
        pb.get_image(pf, &mut payload, rect, 0)
            .context("extract raw payload")?;
        Ok(Bytes::from(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_pixelbuffer::ManagedPixelBuffer;
    use std::io::Cursor;

    fn canonical_tile(width: u32, height: u32) -> ManagedPixelBuffer {
        ManagedPixelBuffer::new(width, height, PixelFormat::canonical())
    }

    #[tokio::test]
    async fn test_read_payload_exact_extent() {
        let pf = PixelFormat::canonical();
        let rect = Rectangle {
            x: 0,
            y: 0,
            width: 4,
            height: 2,
            encoding: ENCODING_RAW,
        };
        let mut data = vec![7u8; 4 * 2 * 4];
        data.extend_from_slice(&[0xAA, 0xBB]); // trailing bytes, untouched

        let mut stream = RfbInStream::new(Cursor::new(data));
        let payload = RawDecoder
            .read_payload(&mut stream, &rect, &pf)
            .await
            .unwrap();
        assert_eq!(payload.len(), 32);
        assert_eq!(stream.read_u8().await.unwrap(), 0xAA);
    }

    #[tokio::test]
    async fn test_encode_decode_round_trip() {
        let pf = PixelFormat::canonical();
        let mut source = canonical_tile(8, 8);
        let red = pf.from_rgb888([200, 10, 10, 255]);
        source.fill_rect(Rect::new(0, 0, 8, 8), &red).unwrap();

        let rect = Rect::new(2, 2, 4, 4);
        let payload = RawEncoder.encode(&source, rect, &pf).unwrap();

        let wire_rect = Rectangle {
            x: 2,
            y: 2,
            width: 4,
            height: 4,
            encoding: ENCODING_RAW,
        };
        let mut tile = canonical_tile(4, 4);
        RawDecoder
            .decode(&payload, &wire_rect, &pf, &mut tile)
            .unwrap();

        assert_eq!(&tile.data()[0..4], &red[..]);
        assert_eq!(&tile.data()[tile.data().len() - 4..], &red[..]);
    }

    #[tokio::test]
    async fn test_decode_wrong_length_fails() {
        let pf = PixelFormat::canonical();
        let rect = Rectangle {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
            encoding: ENCODING_RAW,
        };
        let mut tile = canonical_tile(4, 4);
        assert!(RawDecoder.decode(&[0u8; 3], &rect, &pf, &mut tile).is_err());
    }

    #[tokio::test]
    async fn test_decode_converts_wire_format() {
        // Wire format is big-endian; the tile is canonical little-endian.
        let mut wire_pf = PixelFormat::canonical();
        wire_pf.big_endian = true;

        let rect = Rectangle {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            encoding: ENCODING_RAW,
        };
        // R=0x11 G=0x22 B=0x33 big-endian pixel.
        let payload = [0x00, 0x11, 0x22, 0x33];
        let mut tile = canonical_tile(1, 1);
        RawDecoder
            .decode(&payload, &rect, &wire_pf, &mut tile)
            .unwrap();
        assert_eq!(tile.data(), &[0x33, 0x22, 0x11, 0x00]);
    }
}
