//! Decoder registry and encoder selector.
//!
//! The [`Decoder`] trait is not object-safe (its `read_payload` is generic
//! over the stream), so registered decoders are wrapped in a concrete
//! [`DecoderEntry`] enum and dispatched on the tag. Additional encodings
//! extend the enum.

use crate::{Decoder, Encoder, MutablePixelBuffer, PixelBuffer, PixelFormat};
use crate::{QuantizedDecoder, QuantizedEncoder, RawDecoder, RawEncoder};
use crate::{Rectangle, RfbInStream};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use rfb_common::Rect;
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// Concrete decoder dispatch over the non-object-safe [`Decoder`] trait.
pub enum DecoderEntry {
    Raw(RawDecoder),
    Quantized(QuantizedDecoder),
}

impl DecoderEntry {
    pub fn encoding_type(&self) -> i32 {
        match self {
            Self::Raw(d) => d.encoding_type(),
            Self::Quantized(d) => d.encoding_type(),
        }
    }

    pub fn is_lossless(&self) -> bool {
        match self {
            Self::Raw(d) => d.is_lossless(),
            Self::Quantized(d) => d.is_lossless(),
        }
    }

    pub async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        pf: &PixelFormat,
    ) -> Result<Bytes> {
        match self {
            Self::Raw(d) => d.read_payload(stream, rect, pf).await,
            Self::Quantized(d) => d.read_payload(stream, rect, pf).await,
        }
    }

    pub fn decode(
        &self,
        payload: &[u8],
        rect: &Rectangle,
        pf: &PixelFormat,
        tile: &mut dyn MutablePixelBuffer,
    ) -> Result<()> {
        match self {
            Self::Raw(d) => d.decode(payload, rect, pf, tile),
            Self::Quantized(d) => d.decode(payload, rect, pf, tile),
        }
    }
}

/// Registry of decoders keyed by encoding type.
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: HashMap<i32, DecoderEntry>,
}

impl DecoderRegistry {
    /// Registry with the in-tree codecs registered.
    pub fn with_standard() -> Self {
        let mut registry = Self::default();
        registry.register(DecoderEntry::Raw(RawDecoder));
        registry.register(DecoderEntry::Quantized(QuantizedDecoder));
        registry
    }

    /// Register a decoder entry (replacing any previous one for the same
    /// encoding).
    pub fn register(&mut self, decoder: DecoderEntry) {
        self.decoders.insert(decoder.encoding_type(), decoder);
    }

    /// Get the decoder for an encoding.
    pub fn get(&self, encoding: i32) -> Option<&DecoderEntry> {
        self.decoders.get(&encoding)
    }

    /// Whether the encoding decodes bit-exactly; `None` for unknown
    /// encodings.
    pub fn is_lossless(&self, encoding: i32) -> Option<bool> {
        self.get(encoding).map(DecoderEntry::is_lossless)
    }

    /// Pull the payload for `rect` off the stream using the registered
    /// decoder's framing.
    pub async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        encoding: i32,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        pf: &PixelFormat,
    ) -> Result<Bytes> {
        self.get(encoding)
            .ok_or_else(|| anyhow!("no decoder registered for encoding {encoding}"))?
            .read_payload(stream, rect, pf)
            .await
    }

    /// Decode a payload into a canonical tile at the origin.
    pub fn decode(
        &self,
        encoding: i32,
        payload: &[u8],
        rect: &Rectangle,
        pf: &PixelFormat,
        tile: &mut dyn MutablePixelBuffer,
    ) -> Result<()> {
        self.get(encoding)
            .ok_or_else(|| anyhow!("no decoder registered for encoding {encoding}"))?
            .decode(payload, rect, pf, tile)
    }
}

/// Concrete encoder dispatch.
pub enum EncoderEntry {
    Raw(RawEncoder),
    Quantized(QuantizedEncoder),
}

impl EncoderEntry {
    pub fn encoding_type(&self) -> i32 {
        match self {
            Self::Raw(e) => e.encoding_type(),
            Self::Quantized(e) => e.encoding_type(),
        }
    }

    pub fn is_lossless(&self) -> bool {
        match self {
            Self::Raw(e) => e.is_lossless(),
            Self::Quantized(e) => e.is_lossless(),
        }
    }

    pub fn encode(&self, pb: &dyn PixelBuffer, rect: Rect, pf: &PixelFormat) -> Result<Bytes> {
        match self {
            Self::Raw(e) => e.encode(pb, rect, pf),
            Self::Quantized(e) => e.encode(pb, rect, pf),
        }
    }
}

/// Chooses the inner encoding for each rectangle on the server side.
///
/// Policy is deliberately simple: one preferred encoding per session,
/// selected from configuration. Anything smarter (per-rect content
/// analysis) slots in behind [`EncoderSelector::select`].
pub struct EncoderSelector {
    preferred: i32,
    encoders: HashMap<i32, EncoderEntry>,
}

impl EncoderSelector {
    /// Selector that always produces raw payloads.
    pub fn lossless() -> Self {
        let mut encoders = HashMap::new();
        encoders.insert(RawEncoder.encoding_type(), EncoderEntry::Raw(RawEncoder));
        Self {
            preferred: RawEncoder.encoding_type(),
            encoders,
        }
    }

    /// Selector preferring the quantized lossy codec, with raw available.
    pub fn lossy() -> Self {
        let mut encoders = HashMap::new();
        encoders.insert(RawEncoder.encoding_type(), EncoderEntry::Raw(RawEncoder));
        encoders.insert(
            QuantizedEncoder.encoding_type(),
            EncoderEntry::Quantized(QuantizedEncoder),
        );
        Self {
            preferred: QuantizedEncoder.encoding_type(),
            encoders,
        }
    }

    /// The encoder used for this rectangle.
    pub fn select(&self, _rect: Rect) -> &EncoderEntry {
        self.encoders
            .get(&self.preferred)
            .expect("preferred encoder is registered")
    }

    /// Look up a specific registered encoder.
    pub fn get(&self, encoding: i32) -> Option<&EncoderEntry> {
        self.encoders.get(&encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ENCODING_QUANTIZED, ENCODING_RAW};

    #[test]
    fn test_registry_lookup() {
        let registry = DecoderRegistry::with_standard();
        assert!(registry.get(ENCODING_RAW).is_some());
        assert!(registry.get(ENCODING_QUANTIZED).is_some());
        assert!(registry.get(7).is_none());
        assert_eq!(registry.is_lossless(ENCODING_RAW), Some(true));
        assert_eq!(registry.is_lossless(ENCODING_QUANTIZED), Some(false));
        assert_eq!(registry.is_lossless(7), None);
    }

    #[test]
    fn test_selector_policies() {
        let lossless = EncoderSelector::lossless();
        assert_eq!(
            lossless.select(Rect::new(0, 0, 4, 4)).encoding_type(),
            ENCODING_RAW
        );
        assert!(lossless.select(Rect::new(0, 0, 4, 4)).is_lossless());

        let lossy = EncoderSelector::lossy();
        assert_eq!(
            lossy.select(Rect::new(0, 0, 4, 4)).encoding_type(),
            ENCODING_QUANTIZED
        );
        assert!(!lossy.select(Rect::new(0, 0, 4, 4)).is_lossless());
        assert!(lossy.get(ENCODING_RAW).is_some());
    }
}
