//! Quantized encoding - a deterministic lossy development codec.
//!
//! Posterises each colour channel to its top four bits before transmission,
//! so decoded pixels generally differ from the source while staying fully
//! deterministic. This gives the cache's dual-hash machinery (actual vs
//! canonical identity, hash reports, seed policy) a lossy encoding to run
//! against without pulling a real image codec into the tree.
//!
//! # Wire Format
//!
//! ```text
//! +-------------+
//! | Pixel data  |  width * height * 4 bytes, canonical format, posterised
//! +-------------+
//! ```
//!
//! The payload is always in the canonical 32bpp format regardless of the
//! session's wire format; quantization happens channel-wise on the RGB888
//! values.

use crate::{Decoder, Encoder, MutablePixelBuffer, PixelBuffer, PixelFormat};
use crate::{Rectangle, RfbInStream};
use anyhow::{Context, Result};
use bytes::Bytes;
use rfb_common::Rect;
use tokio::io::AsyncRead;

/// Encoding id of the quantized development codec.
pub const ENCODING_QUANTIZED: i32 = 96;

/// Keep the top four bits of a channel.
fn posterise(channel: u8) -> u8 {
    channel & 0xF0
}

fn payload_len(rect: &Rectangle) -> usize {
    rect.width as usize * rect.height as usize * 4
}

/// Decoder for the quantized codec.
pub struct QuantizedDecoder;

impl Decoder for QuantizedDecoder {
    fn encoding_type(&self) -> i32 {
        ENCODING_QUANTIZED
    }

    fn is_lossless(&self) -> bool {
        false
    }

    async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        _pf: &PixelFormat,
    ) -> Result<Bytes> {
        let len = payload_len(rect);
        let mut payload = vec![0u8; len];
        stream
            .read_bytes(&mut payload)
            .await
            .with_context(|| format!("quantized payload, {len} bytes"))?;
        Ok(Bytes::from(payload))
    }

    fn decode(
        &self,
        payload: &[u8],
        rect: &Rectangle,
        _pf: &PixelFormat,
        tile: &mut dyn MutablePixelBuffer,
    ) -> Result<()> {
        let expected = payload_len(rect);
        if payload.len() != expected {
            anyhow::bail!(
                "quantized payload is {} bytes, expected {}",
                payload.len(),
                expected
            );
        }
        tile.image_rect(
            Rect::new(0, 0, rect.width as u32, rect.height as u32),
            payload,
            0,
        )
        .context("blit quantized tile")
    }
}

/// Encoder for the quantized codec.
pub struct QuantizedEncoder;

impl Encoder for QuantizedEncoder {
    fn encoding_type(&self) -> i32 {
        ENCODING_QUANTIZED
    }

    fn is_lossless(&self) -> bool {
        false
    }

    fn encode(&self, pb: &dyn PixelBuffer, rect: Rect, _pf: &PixelFormat) -> Result<Bytes> {
        let canonical = PixelFormat::canonical();
        let mut payload = pb.canonical_bytes(rect).context("extract pixels")?;
        for px in payload.chunks_exact_mut(4) {
            let rgba = canonical.to_rgb888(px);
            let quantized = canonical.from_rgb888([
                posterise(rgba[0]),
                posterise(rgba[1]),
                posterise(rgba[2]),
                255,
            ]);
            px.copy_from_slice(&quantized);
        }
        Ok(Bytes::from(payload))
    }
}
