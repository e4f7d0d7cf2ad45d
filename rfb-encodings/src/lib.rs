//! Encoder and decoder interfaces for framebuffer rectangles.
//!
//! This crate defines the codec seam the cache orchestrators sit on. The
//! [`Decoder`] contract is split in two so decode work can cross a worker
//! pool boundary:
//!
//! - [`Decoder::read_payload`] runs on the protocol reader and pulls the
//!   encoding's exact byte extent off the stream (each encoding frames its
//!   own payload).
//! - [`Decoder::decode`] is synchronous and turns a payload into canonical
//!   pixels, writing into a tile buffer sized to the rectangle with its
//!   origin at (0, 0). Workers call it without holding any stream or cache
//!   lock.
//!
//! Only the raw codec and a quantizing development codec ship in-tree; real
//! compressed encodings plug in behind the same traits.
//!
//! Decoders must fail fast with clear errors; no defensive fallbacks.

use anyhow::Result;
use bytes::Bytes;
use tokio::io::AsyncRead;

// Re-export types decoders operate on
pub use rfb_pixelbuffer::{MutablePixelBuffer, PixelBuffer, PixelFormat};
pub use rfb_protocol::io::RfbInStream;
pub use rfb_protocol::messages::types::Rectangle;

// Re-export the wire encoding constants rather than duplicating them.
pub use rfb_protocol::messages::types::{
    ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT, ENCODING_CACHED_RECT_SEED,
    ENCODING_LAST_RECT, ENCODING_PERSISTENT_CACHED_RECT, ENCODING_PERSISTENT_CACHED_RECT_INIT,
    ENCODING_RAW, PSEUDO_ENCODING_CONTENT_CACHE, PSEUDO_ENCODING_PERSISTENT_CACHE,
};

pub mod quant;
pub mod raw;
pub mod registry;

pub use quant::{QuantizedDecoder, QuantizedEncoder, ENCODING_QUANTIZED};
pub use raw::{RawDecoder, RawEncoder};
pub use registry::{DecoderEntry, DecoderRegistry, EncoderEntry, EncoderSelector};

/// Decoder for one inner encoding.
///
/// # Contract
///
/// - `read_payload` consumes exactly the bytes the encoding occupies on the
///   wire for `rect` and nothing more.
/// - `decode` writes the rectangle's pixels into `tile` at the origin;
///   `tile` is in the canonical pixel format and sized `rect.width` x
///   `rect.height`.
/// - `is_lossless` reports whether decoded pixels are bit-exact with what
///   the encoder saw; it drives cache persistability and seed policy.
#[allow(async_fn_in_trait)]
pub trait Decoder {
    /// The wire encoding this decoder handles.
    fn encoding_type(&self) -> i32;

    /// Whether this encoding reproduces pixels bit-exactly.
    fn is_lossless(&self) -> bool;

    /// Read the encoding's payload for `rect` off the stream.
    async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        pf: &PixelFormat,
    ) -> Result<Bytes>;

    /// Decode a payload into a canonical tile at the origin.
    fn decode(
        &self,
        payload: &[u8],
        rect: &Rectangle,
        pf: &PixelFormat,
        tile: &mut dyn MutablePixelBuffer,
    ) -> Result<()>;
}

/// Encoder for one inner encoding (server side).
pub trait Encoder {
    /// The wire encoding this encoder produces.
    fn encoding_type(&self) -> i32;

    /// Whether a decode of this payload reproduces pixels bit-exactly.
    fn is_lossless(&self) -> bool;

    /// Encode a rectangle of `pb` into a payload in the wire format `pf`.
    fn encode(
        &self,
        pb: &dyn PixelBuffer,
        rect: rfb_common::Rect,
        pf: &PixelFormat,
    ) -> Result<Bytes>;
}

/// Convert `count` tightly packed pixels between two formats.
pub fn convert_pixels(
    payload: &[u8],
    from: &PixelFormat,
    to: &PixelFormat,
    count: usize,
) -> Result<Vec<u8>> {
    let from_bpp = from.bytes_per_pixel() as usize;
    let to_bpp = to.bytes_per_pixel() as usize;
    if payload.len() < count * from_bpp {
        anyhow::bail!(
            "pixel conversion underrun: {} bytes for {} pixels",
            payload.len(),
            count
        );
    }
    if from == to {
        return Ok(payload[..count * from_bpp].to_vec());
    }
    let mut out = Vec::with_capacity(count * to_bpp);
    for chunk in payload.chunks_exact(from_bpp).take(count) {
        let rgba = from.to_rgb888(chunk);
        out.extend_from_slice(&to.from_rgb888(rgba));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_pixels_identity() {
        let pf = PixelFormat::canonical();
        let data = vec![1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(convert_pixels(&data, &pf, &pf, 2).unwrap(), data);
    }

    #[test]
    fn test_convert_pixels_endianness() {
        let le = PixelFormat::canonical();
        let mut be = le;
        be.big_endian = true;

        // R=0x11 G=0x22 B=0x33 little-endian: [33, 22, 11, 00]
        let data = vec![0x33, 0x22, 0x11, 0x00];
        let converted = convert_pixels(&data, &le, &be, 1).unwrap();
        assert_eq!(converted, vec![0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_convert_pixels_underrun() {
        let pf = PixelFormat::canonical();
        assert!(convert_pixels(&[0, 0], &pf, &pf, 1).is_err());
    }
}
